//! Record store client for the remote `actions` collection.
//!
//! The store is a PostgREST endpoint (the Supabase REST API). Two calls are
//! made against it:
//!
//! ```text
//! GET   {url}/rest/v1/{table}?select=*&result=is.null      -> pending rows
//! PATCH {url}/rest/v1/{table}?id=eq.{id}  {"result": ..}   -> close out one row
//! ```
//!
//! Failures never leave this module: a failed read yields an empty list and a
//! failed write yields `false`, each with an error log line. The rows stay
//! pending in the store, so the next pass picks them up again.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Serialize;
use serde_json::Value;

use crate::action::{ActionId, ActionRecord, ExecutionOutcome};
use crate::config::StoreConfig;
use crate::error::{DispatchError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// PATCH body closing out one row.
#[derive(Serialize)]
struct ResultUpdate<'a> {
    result: &'a str,
}

// ---------------------------------------------------------------------------
// ActionStore
// ---------------------------------------------------------------------------

/// Where pending actions come from and where outcomes go.
pub trait ActionStore {
    /// All records whose `result` is null, in the order the store returns
    /// them. Empty on any failure.
    fn fetch_pending(&self) -> Vec<ActionRecord>;

    /// Write `outcome` into the record's `result`. `false` on any failure.
    fn persist_result(&self, id: &ActionId, outcome: &ExecutionOutcome) -> bool;
}

// ---------------------------------------------------------------------------
// PostgrestStore
// ---------------------------------------------------------------------------

pub struct PostgrestStore {
    client: Client,
    rows_url: String,
    key: String,
}

impl PostgrestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            rows_url: format!("{}/rest/v1/{}", config.url, config.table),
            key: config.key.clone(),
        })
    }

    /// Fallible read used by [`ActionStore::fetch_pending`].
    pub fn try_fetch_pending(&self) -> Result<Vec<ActionRecord>> {
        let resp = self
            .client
            .get(&self.rows_url)
            .query(&[("select", "*"), ("result", "is.null")])
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .send()?;
        let rows: Vec<Value> = check_status(resp)?.json()?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = ActionRecord::from_row(row);
            if record.is_pending() {
                pending.push(record);
            } else {
                tracing::warn!(
                    action_id = %record.id_label(),
                    "store returned an action that already has a result; skipping"
                );
            }
        }
        Ok(pending)
    }

    /// Fallible write used by [`ActionStore::persist_result`].
    pub fn try_persist(&self, id: &ActionId, result_text: &str) -> Result<()> {
        let resp = self
            .client
            .patch(&self.rows_url)
            .query(&[("id", format!("eq.{id}"))])
            .header("apikey", &self.key)
            .header("Prefer", "return=minimal")
            .bearer_auth(&self.key)
            .json(&ResultUpdate {
                result: result_text,
            })
            .send()?;
        check_status(resp)?;
        Ok(())
    }
}

impl ActionStore for PostgrestStore {
    fn fetch_pending(&self) -> Vec<ActionRecord> {
        match self.try_fetch_pending() {
            Ok(records) => {
                tracing::info!(count = records.len(), "found pending actions");
                records
            }
            Err(e) => {
                tracing::error!(error = %e, "error fetching pending actions");
                Vec::new()
            }
        }
    }

    fn persist_result(&self, id: &ActionId, outcome: &ExecutionOutcome) -> bool {
        match self.try_persist(id, &outcome.to_result_text()) {
            Ok(()) => {
                tracing::info!(action_id = %id, exit_code = outcome.exit_code, "updated action result");
                true
            }
            Err(e) => {
                tracing::error!(action_id = %id, error = %e, "error updating action result");
                false
            }
        }
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(DispatchError::StoreStatus {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}
