//! Demo `board` entity: a drop-token game on a 7x6 grid.
//!
//! Cells are stored row-major from the bottom row, so the first token dropped
//! into column `c` lands at `board.cells[c]` and sets `board.heights[c] = 1`.

use std::sync::Arc;

use patchsync_core::{ConflictStrategy, Patch};
use serde_json::{Value, json};

use super::{
    EntityTypeRegistry, EntityTypeSpec, MethodContext, MethodOutcome, MethodRegistry, MethodSpec,
};
use crate::error::ApiError;

pub const ENTITY_TYPE: &str = "board";
pub const COLUMNS: usize = 7;
pub const ROWS: usize = 6;
const CONNECT: usize = 4;

pub fn initial_state() -> Value {
    json!({
        "board": {
            "columns": COLUMNS,
            "rows": ROWS,
            "cells": vec![Value::Null; COLUMNS * ROWS],
            "heights": vec![0; COLUMNS],
        },
        "players": ["P1", "P2"],
        "turn": 0,
        "currentPlayer": "P1",
        "moves": [],
        "winner": null,
    })
}

pub fn register(types: &mut EntityTypeRegistry, methods: &mut MethodRegistry) {
    types.register(
        ENTITY_TYPE,
        EntityTypeSpec {
            strategy: ConflictStrategy::ChangeNumberBased,
            initial_state: initial_state(),
        },
    );
    methods
        .register(
            ENTITY_TYPE,
            "place_token",
            MethodSpec::patching(Arc::new(place_token)).broadcast(),
        )
        .register(
            ENTITY_TYPE,
            "advance_turn",
            MethodSpec::patching(Arc::new(advance_turn)).broadcast(),
        )
        .register(ENTITY_TYPE, "get_board", MethodSpec::query(Arc::new(get_board)));
}

fn cell(state: &Value, row: usize, column: usize) -> Option<&str> {
    state["board"]["cells"][row * COLUMNS + column].as_str()
}

fn height(state: &Value, column: usize) -> usize {
    state["board"]["heights"][column].as_u64().unwrap_or(0) as usize
}

fn ensure_in_progress(state: &Value) -> Result<(), ApiError> {
    match state["winner"].as_str() {
        Some(winner) => Err(ApiError::Rejected(format!("game already won by {}", winner))),
        None => Ok(()),
    }
}

/// Whether placing `player` at (`row`, `column`) completes a line.
fn completes_line(state: &Value, player: &str, row: usize, column: usize) -> bool {
    const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

    let owned = |r: isize, c: isize| -> bool {
        if r < 0 || c < 0 || r as usize >= ROWS || c as usize >= COLUMNS {
            return false;
        }
        let (r, c) = (r as usize, c as usize);
        (r, c) == (row, column) || cell(state, r, c) == Some(player)
    };

    DIRECTIONS.iter().any(|&(dr, dc)| {
        let count_from = |sign: isize| {
            (1..CONNECT as isize)
                .take_while(|step| {
                    owned(
                        row as isize + sign * step * dr,
                        column as isize + sign * step * dc,
                    )
                })
                .count()
        };
        1 + count_from(1) + count_from(-1) >= CONNECT
    })
}

fn place_token(ctx: &MethodContext<'_>) -> Result<MethodOutcome, ApiError> {
    let column: usize = ctx.arg("column")?;
    let player: String = ctx.arg("player")?;
    let state = ctx.state;

    if column >= COLUMNS {
        return Err(ApiError::InvalidArguments(format!(
            "column {} out of range 0..{}",
            column, COLUMNS
        )));
    }
    ensure_in_progress(state)?;
    if state["currentPlayer"].as_str() != Some(player.as_str()) {
        return Err(ApiError::Rejected(format!("it is not {}'s turn", player)));
    }

    let row = height(state, column);
    if row >= ROWS {
        return Err(ApiError::Rejected(format!("column {} is full", column)));
    }

    let index = row * COLUMNS + column;
    let mut patches = vec![
        Patch::set(format!("board.cells[{}]", index), player.as_str()),
        Patch::set(format!("board.heights[{}]", column), row + 1),
        Patch::insert_list(
            "moves",
            json!({"player": player, "column": column, "row": row}),
            None,
        ),
    ];
    let won = completes_line(state, &player, row, column);
    if won {
        patches.push(Patch::set("winner", player.as_str()));
    }

    tracing::debug!(
        "place_token on {}: {} -> column {} row {}{}",
        ctx.key,
        player,
        column,
        row,
        if won { " (win)" } else { "" }
    );

    Ok(MethodOutcome {
        result: json!({"row": row, "index": index, "won": won}),
        patches,
    })
}

fn advance_turn(ctx: &MethodContext<'_>) -> Result<MethodOutcome, ApiError> {
    let state = ctx.state;
    ensure_in_progress(state)?;

    let players: Vec<&str> = state["players"]
        .as_array()
        .map(|p| p.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if players.is_empty() {
        return Err(ApiError::Rejected("board has no players".to_string()));
    }

    let turn = state["turn"].as_u64().unwrap_or(0) + 1;
    let next = players[(turn as usize) % players.len()];

    Ok(MethodOutcome {
        result: json!({"turn": turn, "currentPlayer": next}),
        patches: vec![Patch::set("turn", turn), Patch::set("currentPlayer", next)],
    })
}

fn get_board(ctx: &MethodContext<'_>) -> Result<MethodOutcome, ApiError> {
    Ok(MethodOutcome::value(ctx.state.clone()))
}
