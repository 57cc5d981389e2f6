use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use mgrpc_codec::ConnectionInfo;
use mgrpc_frame::Response;

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
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Prints a completed call. The device's `result` payload is opaque
/// JSON; only the envelope around it is ours.
pub fn print_response(resp: &Response, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"])
                .add_row(vec!["id".to_string(), resp.id.to_string()])
                .add_row(vec!["status".to_string(), resp.status.to_string()])
                .add_row(vec!["result".to_string(), result_text(resp)]);
            if !resp.status_msg.is_empty() {
                table.add_row(vec!["message".to_string(), resp.status_msg.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{}", pretty_result(resp));
        }
        OutputFormat::Raw => {
            print_raw(result_text(resp).as_bytes());
            println!();
        }
    }
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    connected: bool,
    tls: bool,
    remote_addr: &'a str,
    peer_certificates: usize,
}

pub fn print_info(info: &ConnectionInfo, format: OutputFormat) {
    let out = InfoOutput {
        connected: info.is_connected,
        tls: info.tls,
        remote_addr: &info.remote_addr,
        peer_certificates: info.peer_certificates.len(),
    };
    match format {
        OutputFormat::Json => {
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
                .set_header(vec!["FIELD", "VALUE"])
                .add_row(vec!["connected".to_string(), out.connected.to_string()])
                .add_row(vec!["tls".to_string(), out.tls.to_string()])
                .add_row(vec!["remote".to_string(), out.remote_addr.to_string()])
                .add_row(vec![
                    "peer certificates".to_string(),
                    out.peer_certificates.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Remote:            {}", out.remote_addr);
            println!("  Connected:         {}", out.connected);
            println!("  TLS:               {}", out.tls);
            println!("  Peer certificates: {}", out.peer_certificates);
        }
        OutputFormat::Raw => {
            println!("{}", out.remote_addr);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn result_text(resp: &Response) -> String {
    match &resp.response {
        Some(raw) => raw.get().to_string(),
        None => "null".to_string(),
    }
}

/// Re-indents the device's result for human eyes; falls back to the raw
/// text if it will not re-parse.
fn pretty_result(resp: &Response) -> String {
    let text = result_text(resp);
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(text),
        Err(_) => text,
    }
}
