use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use eshm_link::{Endpoint, EshmError};

use crate::cmd::{install_ctrlc_handler, parse_duration, ListenArgs, READ_SLICE};
use crate::exit::{link_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_message, Message, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.to_config()?;
    let idle_timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let endpoint = Endpoint::open(config).map_err(|err| link_error("open failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    let mut last_message = Instant::now();

    while running.load(Ordering::SeqCst) {
        let payload = match endpoint.read_timeout(READ_SLICE) {
            Ok(payload) => payload,
            Err(EshmError::Timeout(_)) => {
                if let Some(limit) = idle_timeout {
                    if last_message.elapsed() >= limit {
                        return Err(CliError::new(
                            TIMEOUT,
                            format!("no message on {} within {limit:?}", endpoint.name()),
                        ));
                    }
                }
                continue;
            }
            Err(err) => return Err(link_error("receive failed", err)),
        };
        last_message = Instant::now();

        let items = if args.raw {
            None
        } else {
            match eshm_codec::decode_items(&payload) {
                Ok(items) => Some(items),
                Err(err) => {
                    tracing::warn!(
                        region = endpoint.name(),
                        size = payload.len(),
                        error = %err,
                        "payload is not an item message, printing raw"
                    );
                    None
                }
            }
        };

        print_message(
            &Message {
                region: endpoint.name(),
                role: endpoint.role(),
                payload: &payload,
                items: items.as_deref(),
            },
            format,
        );
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}
