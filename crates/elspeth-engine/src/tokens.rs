// elspeth-engine/src/tokens.rs
// ============================================================================
// Module: Engine Token Manager
// Description: Row and token creation with fork, expand, and join lineage.
// Purpose: Keep token genealogy append-only and outcomes single-terminal.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! The token manager is the only component that creates rows and tokens.
//! Rows and their first token are created in one transaction; fork children
//! share a fresh fork group and link back to the parent; deaggregation
//! children share an expand group; coalesce joins create one child with a
//! parent link per merged token. Lineage is an append-only `token_parents`
//! table; no in-memory parent/child cycle exists.

// ============================================================================
// SECTION: Imports
// ============================================================================

use elspeth_core::GroupId;
use elspeth_core::NodeId;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::RunId;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::TokenOutcome;
use elspeth_core::TokenOutcomeRecord;
use elspeth_core::TokenParent;
use elspeth_core::TokenRecord;
use elspeth_landscape::Landscape;
use elspeth_landscape::LandscapeError;

// ============================================================================
// SECTION: Token Manager
// ============================================================================

/// Creates rows, tokens, and lineage records in the Landscape.
#[derive(Clone)]
pub struct TokenManager {
    /// Audit store.
    landscape: Landscape,
}

impl TokenManager {
    /// Creates a token manager over a Landscape.
    #[must_use]
    pub const fn new(landscape: Landscape) -> Self {
        Self { landscape }
    }

    /// Creates a row and its first token in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    pub fn create_row_with_token(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        source_data_hash: String,
        payload_ref: Option<String>,
    ) -> Result<(RowRecord, TokenRecord), LandscapeError> {
        let row = RowRecord {
            row_id: RowId::generate(),
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash,
            payload_ref,
        };
        let token = TokenRecord {
            token_id: TokenId::generate(),
            row_id: row.row_id.clone(),
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: Some(0),
        };
        self.landscape.create_row_with_token(&row, &token)?;
        Ok((row, token))
    }

    /// Creates fork children for a parent token, one per branch.
    ///
    /// All children share a fresh fork group; the parent receives the
    /// `Forked` outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when any write fails.
    pub fn fork_children(
        &self,
        parent: &TokenRecord,
        branches: &[String],
        step_in_pipeline: u32,
    ) -> Result<Vec<TokenRecord>, LandscapeError> {
        let fork_group = GroupId::generate_fork();
        let mut children = Vec::with_capacity(branches.len());
        for branch in branches {
            let child = TokenRecord {
                token_id: TokenId::generate(),
                row_id: parent.row_id.clone(),
                fork_group_id: Some(fork_group.clone()),
                join_group_id: None,
                expand_group_id: None,
                branch_name: Some(branch.clone()),
                step_in_pipeline: Some(step_in_pipeline),
            };
            let link = TokenParent {
                token_id: child.token_id.clone(),
                parent_token_id: parent.token_id.clone(),
                ordinal: 0,
            };
            self.landscape.create_child_token(&child, &[link])?;
            children.push(child);
        }
        self.record_outcome(&parent.token_id, TokenOutcome::Forked, None)?;
        Ok(children)
    }

    /// Creates deaggregation children for a flushed batch.
    ///
    /// All children share a fresh expand group and link to every batch
    /// member (ordinals follow member order).
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when any write fails.
    pub fn expand_children(
        &self,
        members: &[TokenRecord],
        output_count: usize,
        step_in_pipeline: u32,
    ) -> Result<Vec<TokenRecord>, LandscapeError> {
        let expand_group = GroupId::generate_expand();
        let carrier_row = members.first().map(|member| member.row_id.clone());
        let mut children = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let Some(row_id) = carrier_row.clone() else {
                break;
            };
            let child = TokenRecord {
                token_id: TokenId::generate(),
                row_id,
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: Some(expand_group.clone()),
                branch_name: None,
                step_in_pipeline: Some(step_in_pipeline),
            };
            let links: Vec<TokenParent> = members
                .iter()
                .enumerate()
                .map(|(ordinal, member)| TokenParent {
                    token_id: child.token_id.clone(),
                    parent_token_id: member.token_id.clone(),
                    ordinal: ordinal.try_into().unwrap_or(u32::MAX),
                })
                .collect();
            self.landscape.create_child_token(&child, &links)?;
            children.push(child);
        }
        Ok(children)
    }

    /// Joins fork siblings into one coalesced token with multi-parent links.
    ///
    /// Each merged sibling receives the `Coalesced` outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when any write fails.
    pub fn coalesce_join(
        &self,
        siblings: &[TokenRecord],
        step_in_pipeline: u32,
    ) -> Result<TokenRecord, LandscapeError> {
        let join_group = GroupId::generate_join();
        let row_id = siblings
            .first()
            .map(|token| token.row_id.clone())
            .ok_or_else(|| LandscapeError::Invalid("coalesce requires at least one token".to_string()))?;
        let joined = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            fork_group_id: None,
            join_group_id: Some(join_group),
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: Some(step_in_pipeline),
        };
        let links: Vec<TokenParent> = siblings
            .iter()
            .enumerate()
            .map(|(ordinal, sibling)| TokenParent {
                token_id: joined.token_id.clone(),
                parent_token_id: sibling.token_id.clone(),
                ordinal: ordinal.try_into().unwrap_or(u32::MAX),
            })
            .collect();
        self.landscape.create_child_token(&joined, &links)?;
        for sibling in siblings {
            self.record_outcome(&sibling.token_id, TokenOutcome::Coalesced, None)?;
        }
        Ok(joined)
    }

    /// Records a token outcome at the moment of determination.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::DuplicateOutcome`] on a second terminal
    /// outcome.
    pub fn record_outcome(
        &self,
        token_id: &TokenId,
        outcome: TokenOutcome,
        reason: Option<String>,
    ) -> Result<(), LandscapeError> {
        self.landscape.record_token_outcome(&TokenOutcomeRecord {
            token_id: token_id.clone(),
            outcome,
            reason,
            recorded_at: Timestamp::now(),
        })
    }
}
