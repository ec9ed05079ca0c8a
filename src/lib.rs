//! # Capture Harness
//!
//! A capture-to-storage ingestion pipeline for webpage snapshots.
//!
//! A browser-side capture agent submits a screenshot, the page HTML, and
//! some context. Capture Harness cleans the HTML into a bounded structural
//! summary, optionally asks an external chat-completions service for an
//! analysis, stores the results durably in SQLite linked to a project, and
//! announces each finished artifact as an event.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐   ┌────────────┐
//! │  capture  │──▶│ cleaned_dir  │──▶│  ingestor  │──▶│prompt_store│
//! │ POST      │   │ processed.   │   │ lock+dedup │   │ {s}_{ts}/  │
//! │ /process  │   │ json         │   │ + analysis │   └─────┬──────┘
//! └───────────┘   └──────────────┘   └─────┬──────┘         │
//!                                          │ event          ▼
//!                                          ▼          ┌────────────┐
//!                                   ┌────────────┐    │  uploader  │
//!                                   │   events   │    │ blob store │
//!                                   │ broker or  │    │ + projects │
//!                                   │ direct     │    └────────────┘
//!                                   └────────────┘
//! ```
//!
//! The staging directories are the durable queue: every stage reads from
//! disk, so a crashed process picks up where it stopped.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Typed errors at component seams |
//! | [`capture`] | Session manager and capture submission |
//! | [`analysis`] | Segmented, retrying analysis client |
//! | [`lock`] | Marker-file locks |
//! | [`watch`] | Debounced directory watcher |
//! | [`queue`] | Single-worker job queue |
//! | [`ingestor`] | Watch-queue ingestor for cleaned artifacts |
//! | [`blob_store`] | Chunked SQLite blob storage |
//! | [`sqlite_store`] | SQLite project and event stores |
//! | [`uploader`] | Durable uploader with project linkage |
//! | [`events`] | Event publisher and consumers |
//! | [`server`] | HTTP server |

pub mod analysis;
pub mod blob_store;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ingestor;
pub mod lock;
pub mod migrate;
pub mod queue;
pub mod server;
pub mod sqlite_store;
pub mod uploader;
pub mod watch;
