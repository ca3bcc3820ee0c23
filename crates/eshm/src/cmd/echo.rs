use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eshm_link::{Endpoint, EshmError};

use crate::cmd::{install_ctrlc_handler, EchoArgs, READ_SLICE};
use crate::exit::{link_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let config = args.link.to_config()?;
    let endpoint = Endpoint::open(config).map_err(|err| link_error("open failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut echoed = 0usize;
    while running.load(Ordering::SeqCst) {
        let payload = match endpoint.read_timeout(READ_SLICE) {
            Ok(payload) => payload,
            Err(EshmError::Timeout(_)) => continue,
            Err(err) => return Err(link_error("receive failed", err)),
        };

        tracing::info!(
            region = endpoint.name(),
            role = %endpoint.role(),
            size = payload.len(),
            "echoing message"
        );
        endpoint
            .write(&payload)
            .map_err(|err| link_error("echo write failed", err))?;
        echoed = echoed.saturating_add(1);

        if let Some(count) = args.count {
            if echoed >= count {
                break;
            }
        }
    }

    Ok(SUCCESS)
}
