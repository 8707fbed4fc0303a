//! # ydev2db
//!
//! Collects telemetry from devices publishing to a remote MQTT broker and
//! stores it in MySQL.
//!
//! The broker is only reachable over SSH, so every collection cycle opens a
//! tunnel, forwards a local port to the broker, subscribes to the device's
//! topics and writes each message as a row in a table named after the
//! reporting unit. Any failure tears the cycle down and starts a new one
//! after a pause.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ssh   ┌────────────┐  mqtt  ┌─────────────┐  sql  ┌─────────┐
//! │ Devices  │──────▶│ Broker host │──────▶│ Ingest loop │─────▶│  MySQL  │
//! └──────────┘        └────────────┘        └─────────────┘       └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ydev2db configure                 # write ./config/ydev2db.toml
//! ydev2db check                     # validate it
//! ydev2db db create ydev2db         # create the database
//! ydev2db collect --show            # run, displaying each message
//! ydev2db read --table meter1       # last rows stored for a unit
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`schema`] | Table schema parsing |
//! | [`models`] | Broker messages and decoded telemetry |
//! | [`tunnel`] | SSH tunnel with local port forwarding |
//! | [`broker`] | MQTT subscription |
//! | [`store`] | MySQL connection and statement builders |
//! | [`ingest`] | The reconnecting ingestion loop |
//! | [`error`] | Error kinds and their dispositions |
//! | [`progress`] | Collect progress output |
//! | [`admin`] | Store maintenance commands |
//! | [`autostart`] | systemd unit management |
//! | [`scaffold`] | Configuration template |
//! | [`logging`] | Tracing setup |

pub mod admin;
pub mod autostart;
pub mod broker;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod progress;
pub mod scaffold;
pub mod schema;
pub mod store;
pub mod tunnel;
