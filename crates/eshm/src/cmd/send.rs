use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use eshm_codec::DataItem;
use eshm_link::Endpoint;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{link_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, Message, OutputFormat};

const PEER_POLL: Duration = Duration::from_millis(5);

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.to_config()?;
    let wait_peer = parse_duration(&args.wait_peer)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let endpoint = Endpoint::open(config).map_err(|err| link_error("open failed", err))?;
    wait_for_peer(&endpoint, wait_peer)?;

    endpoint
        .write(&payload)
        .map_err(|err| link_error("write failed", err))?;
    tracing::info!(
        region = endpoint.name(),
        role = %endpoint.role(),
        size = payload.len(),
        "message written"
    );

    if args.wait {
        let reply = endpoint
            .read_timeout(wait_timeout)
            .map_err(|err| link_error("receive failed", err))?;
        let items = if args.raw {
            None
        } else {
            Some(
                eshm_codec::decode_items(&reply)
                    .map_err(|err| crate::exit::codec_error("reply is not an item message", err))?,
            )
        };
        print_message(
            &Message {
                region: endpoint.name(),
                role: endpoint.role(),
                payload: &reply,
                items: items.as_deref(),
            },
            format,
        );
    }

    Ok(SUCCESS)
}

fn wait_for_peer(endpoint: &Endpoint, timeout: Duration) -> CliResult<()> {
    let start = Instant::now();
    while !endpoint.is_remote_alive() {
        if start.elapsed() >= timeout {
            return Err(CliError::new(
                TIMEOUT,
                format!("peer did not attach to {} within {timeout:?}", endpoint.name()),
            ));
        }
        thread::sleep(PEER_POLL);
    }
    Ok(())
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if !args.item.is_empty() {
        let items = args
            .item
            .iter()
            .map(|arg| parse_item(arg))
            .collect::<CliResult<Vec<_>>>()?;
        let encoded = eshm_codec::encode_items(&items)
            .map_err(|err| crate::exit::codec_error("item encoding failed", err))?;
        return Ok(encoded.to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

/// Parse `key=type:value`.
fn parse_item(input: &str) -> CliResult<DataItem> {
    let usage = |reason: &str| CliError::new(USAGE, format!("invalid --item {input:?}: {reason}"));

    let (key, typed) = input
        .split_once('=')
        .ok_or_else(|| usage("expected key=type:value"))?;
    let (kind, value) = typed
        .split_once(':')
        .ok_or_else(|| usage("expected type:value after '='"))?;

    match kind {
        "int" => value
            .parse::<i64>()
            .map(|v| DataItem::integer(key, v))
            .map_err(|_| usage("not a 64-bit integer")),
        "bool" => match value {
            "true" | "1" => Ok(DataItem::boolean(key, true)),
            "false" | "0" => Ok(DataItem::boolean(key, false)),
            _ => Err(usage("expected true or false")),
        },
        "real" => value
            .parse::<f64>()
            .map(|v| DataItem::real(key, v))
            .map_err(|_| usage("not a number")),
        "str" => Ok(DataItem::string(key, value)),
        "hex" => parse_hex(value)
            .map(|bytes| DataItem::binary(key, bytes))
            .ok_or_else(|| usage("expected an even number of hex digits")),
        other => Err(usage(&format!("unknown type {other:?}"))),
    }
}

fn parse_hex(input: &str) -> Option<Vec<u8>> {
    let input = input.strip_prefix("0x").unwrap_or(input);
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| input.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
