//! One-shot requests against the server's HTTP endpoints.

use std::path::Path;

use patchsync_core::transport::PatchesBody;
use patchsync_core::{EntityKey, Patch, PatchResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::config::CliConfig;
use super::{CliError, runtime};

/// Split `PATH=VALUE`. A value that is not valid JSON is taken as a string.
fn parse_assignment(spec: &str) -> Result<(String, Value), CliError> {
    let (path, raw) = spec.split_once('=').ok_or_else(|| CliError::InvalidPatch {
        spec: spec.to_string(),
        reason: "expected PATH=VALUE".to_string(),
    })?;
    let path = path.trim();
    if path.is_empty() {
        return Err(CliError::InvalidPatch {
            spec: spec.to_string(),
            reason: "empty path".to_string(),
        });
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((path.to_string(), value))
}

fn parse_removal(spec: &str) -> Result<Patch, CliError> {
    let (path, value) = parse_assignment(spec)?;
    let index = value
        .as_u64()
        .ok_or_else(|| CliError::InvalidPatch {
            spec: spec.to_string(),
            reason: "index must be a non-negative integer".to_string(),
        })?;
    Ok(Patch::remove_list(path, index as usize))
}

/// Patches from a file: either a bare array or `{"patches": [...]}`.
fn read_patch_file(path: &Path) -> Result<Vec<Patch>, CliError> {
    let contents = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&contents)?;
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }
    let body: PatchesBody = serde_json::from_value(value)?;
    Ok(body.patches)
}

/// Build the patch list for `send` in flag order: file, sets, appends, removals.
pub fn collect_patches(
    set: &[String],
    append: &[String],
    remove: &[String],
    file: Option<&Path>,
) -> Result<Vec<Patch>, CliError> {
    let mut patches = match file {
        Some(path) => read_patch_file(path)?,
        None => Vec::new(),
    };
    for spec in set {
        let (path, value) = parse_assignment(spec)?;
        patches.push(Patch::set(path, value));
    }
    for spec in append {
        let (path, value) = parse_assignment(spec)?;
        patches.push(Patch::insert_list(path, value, None));
    }
    for spec in remove {
        patches.push(parse_removal(spec)?);
    }
    Ok(patches)
}

async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    Err(CliError::Server {
        status: status.as_u16(),
        message,
    })
}

fn with_user(request: reqwest::RequestBuilder, config: &CliConfig) -> reqwest::RequestBuilder {
    match &config.user_id {
        Some(user) => request.header("x-user-id", user),
        None => request,
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("✗ {}", e),
    }
}

fn report<T>(result: Result<T, CliError>, on_ok: impl FnOnce(T)) -> bool {
    match result {
        Ok(value) => {
            on_ok(value);
            true
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            false
        }
    }
}

pub fn handle_send(
    config: &CliConfig,
    key: &EntityKey,
    set: &[String],
    append: &[String],
    remove: &[String],
    file: Option<&Path>,
) -> bool {
    let result = (|| {
        let patches = collect_patches(set, append, remove, file)?;
        if patches.is_empty() {
            return Err(CliError::InvalidPatch {
                spec: String::new(),
                reason: "nothing to send; use --set, --append, --remove or --file".to_string(),
            });
        }
        let url = format!("{}/patches", config.entity_url(key));
        log::debug!("[send] POST {} ({} patches)", url, patches.len());

        runtime()?.block_on(async {
            let request = reqwest::Client::new()
                .post(&url)
                .json(&PatchesBody { patches });
            let response = with_user(request, config).send().await?;
            read_response::<PatchResponse>(response).await
        })
    })();

    report(result, |response| {
        println!(
            "✓ {} committed at change {}",
            key, response.new_change_number
        );
    })
}

pub fn handle_call(config: &CliConfig, key: &EntityKey, method: &str, args: Option<&str>) -> bool {
    let result = (|| {
        let args: Value = match args {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Object(Default::default()),
        };
        let url = config.rpc_url(key, method);
        log::debug!("[call] POST {}", url);

        runtime()?.block_on(async {
            let request = reqwest::Client::new().post(&url).json(&args);
            let response = with_user(request, config).send().await?;
            read_response::<Value>(response).await
        })
    })();

    report(result, |response| {
        if let Some(change) = response["newChangeNumber"].as_u64() {
            let committed = response["patchBatches"]
                .as_array()
                .is_some_and(|batches| !batches.is_empty());
            if committed {
                println!("✓ {} on {} committed at change {}", method, key, change);
            }
        }
        print_json(&response["result"]);
    })
}

pub fn handle_get(config: &CliConfig, key: &EntityKey) -> bool {
    let result = (|| {
        let url = config.entity_url(key);
        runtime()?.block_on(async {
            let response = reqwest::get(&url).await?;
            read_response::<Value>(response).await
        })
    })();

    report(result, |response| {
        println!(
            "{} @ {}",
            key,
            response["changeNumber"].as_u64().unwrap_or(0)
        );
        print_json(&response["state"]);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_core::PatchOperation;
    use serde_json::json;

    #[test]
    fn test_assignment_values_are_json_or_string() {
        assert_eq!(
            parse_assignment("board.cells[3]=\"P1\"").unwrap(),
            ("board.cells[3]".to_string(), json!("P1"))
        );
        assert_eq!(parse_assignment("turn=2").unwrap().1, json!(2));
        assert_eq!(parse_assignment("name=bob").unwrap().1, json!("bob"));
        assert_eq!(parse_assignment("eq=a=b").unwrap().1, json!("a=b"));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_collect_patches_in_flag_order() {
        let patches = collect_patches(
            &["turn=1".to_string()],
            &["moves={\"column\":2}".to_string()],
            &["moves=0".to_string()],
            None,
        )
        .unwrap();

        let ops: Vec<PatchOperation> = patches.iter().map(|p| p.operation).collect();
        assert_eq!(
            ops,
            vec![
                PatchOperation::Set,
                PatchOperation::InsertList,
                PatchOperation::RemoveList
            ]
        );
        assert_eq!(patches[1].value, Some(json!({"column": 2})));
        assert_eq!(patches[2].index, Some(0));
    }

    #[test]
    fn test_negative_removal_index_is_rejected() {
        let err = collect_patches(&[], &[], &["moves=-1".to_string()], None).unwrap_err();
        assert!(matches!(err, CliError::InvalidPatch { .. }));
    }

    #[test]
    fn test_patch_file_accepts_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        std::fs::write(
            &bare,
            r#"[{"operation":"SET","fieldPath":"turn","value":"3"}]"#,
        )
        .unwrap();
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"patches":[{"operation":"CLEAR_LIST","fieldPath":"moves"}]}"#,
        )
        .unwrap();

        let patches = collect_patches(&[], &[], &[], Some(&bare)).unwrap();
        assert_eq!(patches[0].value, Some(json!(3)));
        let patches = collect_patches(&[], &[], &[], Some(&wrapped)).unwrap();
        assert_eq!(patches[0].operation, PatchOperation::ClearList);
    }
}
