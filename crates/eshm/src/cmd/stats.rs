use crate::cmd::StatsArgs;
use crate::exit::{link_error, CliResult, SUCCESS};
use crate::output::{print_stats, OutputFormat};

pub fn run(args: StatsArgs, format: OutputFormat) -> CliResult<i32> {
    let stats = eshm_link::inspect(&args.name)
        .map_err(|err| link_error(&format!("cannot inspect {}", args.name), err))?;
    print_stats(&stats, format);
    Ok(SUCCESS)
}
