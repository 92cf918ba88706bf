use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use capstream_rpc::{ConnectionInfo, ConnectionState};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct SnapshotOutput<'a> {
    schema_id: &'a str,
    connections: &'a [ConnectionInfo],
    timestamp: String,
}

pub fn print_snapshot(connections: &[ConnectionInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = SnapshotOutput {
                schema_id: "https://schemas.capstream.dev/cli/v1/connection-snapshot.schema.json",
                connections,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "PEER", "STATE", "RECV", "SENT", "WAITING"]);
            for info in connections {
                table.add_row(vec![
                    info.id.to_string(),
                    info.peer_addr.clone(),
                    state_name(info.state).to_string(),
                    info.recv_count.to_string(),
                    info.send_count.to_string(),
                    info.waiting_for_data.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for info in connections {
                println!(
                    "conn={} peer={} state={} recv={} sent={} waiting={}",
                    info.id,
                    info.peer_addr,
                    state_name(info.state),
                    info.recv_count,
                    info.send_count,
                    info.waiting_for_data
                );
            }
        }
    }
}

pub fn state_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Accepted => "ACCEPTED",
        ConnectionState::Running => "RUNNING",
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
