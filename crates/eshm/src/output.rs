use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use eshm_codec::{DataItem, DataValue};
use eshm_link::{RegionStats, Role, RoleStats};
use serde::Serialize;

const MESSAGE_SCHEMA_ID: &str =
    "https://schemas.3leaps.dev/eshm/cli/v1/message-received.schema.json";
const STATS_SCHEMA_ID: &str = "https://schemas.3leaps.dev/eshm/cli/v1/region-stats.schema.json";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

/// A received message and, unless it was read raw, its decoded items.
pub struct Message<'a> {
    pub region: &'a str,
    pub role: Role,
    pub payload: &'a [u8],
    pub items: Option<&'a [DataItem]>,
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    region: &'a str,
    role: Role,
    payload_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Vec<ItemOutput<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    timestamp: String,
}

#[derive(Serialize)]
struct ItemOutput<'a> {
    key: &'a str,
    #[serde(rename = "type")]
    data_type: &'static str,
    value: serde_json::Value,
}

impl<'a> ItemOutput<'a> {
    fn new(item: &'a DataItem) -> Self {
        Self {
            key: &item.key,
            data_type: item.data_type.name(),
            value: json_value(&item.value),
        }
    }
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    schema_id: &'a str,
    #[serde(flatten)]
    stats: &'a RegionStats,
}

pub fn print_message(message: &Message<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: MESSAGE_SCHEMA_ID,
                region: message.region,
                role: message.role,
                payload_size: message.payload.len(),
                items: message
                    .items
                    .map(|items| items.iter().map(ItemOutput::new).collect()),
                payload: message
                    .items
                    .is_none()
                    .then(|| payload_preview(message.payload)),
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
                .set_content_arrangement(ContentArrangement::Dynamic);
            match message.items {
                Some(items) => {
                    table.set_header(vec!["KEY", "TYPE", "VALUE"]);
                    for item in items {
                        table.add_row(vec![
                            item.key.clone(),
                            item.data_type.to_string(),
                            display_value(&item.value),
                        ]);
                    }
                }
                None => {
                    table
                        .set_header(vec!["REGION", "ROLE", "SIZE", "PAYLOAD"])
                        .add_row(vec![
                            message.region.to_string(),
                            message.role.to_string(),
                            message.payload.len().to_string(),
                            payload_preview(message.payload),
                        ]);
                }
            }
            println!("{table}");
        }
        OutputFormat::Pretty => match message.items {
            Some(items) => {
                println!(
                    "region={} size={} items={}",
                    message.region,
                    message.payload.len(),
                    items.len()
                );
                for item in items {
                    println!(
                        "  {} ({}) = {}",
                        item.key,
                        item.data_type,
                        display_value(&item.value)
                    );
                }
            }
            None => println!(
                "region={} size={} payload={}",
                message.region,
                message.payload.len(),
                payload_preview(message.payload)
            ),
        },
        OutputFormat::Raw => print_raw(message.payload),
    }
}

pub fn print_stats(stats: &RegionStats, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            let out = StatsOutput {
                schema_id: STATS_SCHEMA_ID,
                stats,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut roles = Table::new();
            roles
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ROLE", "PID", "ALIVE", "HEARTBEAT", "GENERATION"])
                .add_row(role_row("master", &stats.master))
                .add_row(role_row("slave", &stats.slave));

            let mut channels = Table::new();
            channels
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DIRECTION", "WRITES", "READS"])
                .add_row(vec![
                    "master -> slave".to_string(),
                    stats.master_to_slave.write_count.to_string(),
                    stats.master_to_slave.read_count.to_string(),
                ])
                .add_row(vec![
                    "slave -> master".to_string(),
                    stats.slave_to_master.write_count.to_string(),
                    stats.slave_to_master.read_count.to_string(),
                ]);

            println!(
                "region {} (stale threshold {} ms, lock reclaims {})",
                stats.name, stats.stale_threshold_ms, stats.lock_reclaims
            );
            println!("{roles}");
            println!("{channels}");
        }
        OutputFormat::Pretty => {
            println!(
                "region={} stale_threshold_ms={} lock_reclaims={}",
                stats.name, stats.stale_threshold_ms, stats.lock_reclaims
            );
            for (label, role) in [("master", &stats.master), ("slave", &stats.slave)] {
                println!(
                    "  {label}: pid={} alive={} heartbeat={} generation={}",
                    role.pid, role.alive, role.heartbeat, role.generation
                );
            }
            println!(
                "  master->slave: writes={} reads={}",
                stats.master_to_slave.write_count, stats.master_to_slave.read_count
            );
            println!(
                "  slave->master: writes={} reads={}",
                stats.slave_to_master.write_count, stats.slave_to_master.read_count
            );
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn role_row(label: &str, role: &RoleStats) -> Vec<String> {
    vec![
        label.to_string(),
        role.pid.to_string(),
        role.alive.to_string(),
        role.heartbeat.to_string(),
        role.generation.to_string(),
    ]
}

fn json_value(value: &DataValue) -> serde_json::Value {
    match value {
        DataValue::Integer(v) => serde_json::Value::from(*v),
        DataValue::Boolean(v) => serde_json::Value::from(*v),
        // Non-finite reals have no JSON form and become null.
        DataValue::Real(v) => serde_json::Value::from(*v),
        DataValue::String(v) => serde_json::Value::from(v.as_str()),
        DataValue::Binary(v) => serde_json::Value::from(to_hex(v)),
    }
}

fn display_value(value: &DataValue) -> String {
    match value {
        DataValue::Integer(v) => v.to_string(),
        DataValue::Boolean(v) => v.to_string(),
        DataValue::Real(v) => v.to_string(),
        DataValue::String(v) => v.clone(),
        DataValue::Binary(v) => format!("0x{}", to_hex(v)),
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
