//! # Upload Harness
//!
//! Crash-safe bulk upload of local documents into a remote file search
//! store, under unknown and variable rate limits.
//!
//! Every file is tracked by a durable lifecycle record. Each remote call
//! is bracketed by a committed intent and a committed result, so an
//! interrupted run can always be resolved on the next start.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────────────────┐
//! │ Scanner  │──▶│  Lifecycle   │◀─▶│        Orchestrator        │
//! │ walkdir  │   │  Store       │   │ cohorts · gates · passes   │
//! └──────────┘   │  (SQLite)    │   └─────────────┬──────────────┘
//!                └──────▲───────┘                 │
//!                       │                 ┌───────▼────────┐
//!                ┌──────┴───────┐         │ Remote Client  │
//!                │  Recovery    │────────▶│ breaker+limiter│──▶ File Search API
//!                └──────────────┘         └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! uph init                      # create database
//! uph scan                      # seed records from [scan].root
//! uph run                       # recover, then upload everything eligible
//! uph status                    # counts per state, failed files
//! uph reconcile                 # compare with a live remote listing
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Lifecycle states and records |
//! | [`state_store`] | Durable lifecycle records and audit log |
//! | [`breaker`] | Rate-limit circuit breaker |
//! | [`limiter`] | Request pacing and adaptive concurrency |
//! | [`remote`] | File search transport and client |
//! | [`orchestrator`] | Drives eligible files to `Indexed` |
//! | [`recovery`] | Resolves interrupted transitions at startup |
//! | [`reconcile`] | Cross-check against a remote listing |
//! | [`scanner`] | Local directory scanning |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod breaker;
pub mod config;
pub mod db;
pub mod error;
pub mod limiter;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod recovery;
pub mod remote;
pub mod scanner;
pub mod shutdown;
pub mod state_store;
pub mod status;
pub mod writer_lock;
