use mgrpc_session::{Session, SessionOptions};

use crate::cmd::{parse_duration, InfoArgs};
use crate::exit::{session_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_info, OutputFormat};

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let mut opts = SessionOptions {
        call_timeout: timeout,
        ..Default::default()
    };
    opts.codec.serial.baud_rate = args.baud;

    let session = tokio::time::timeout(timeout, Session::connect(&args.address, opts))
        .await
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("no connection to {} within {:?}", args.address, timeout),
            )
        })?
        .map_err(|err| session_error("connect failed", err))?;

    print_info(&session.info(), format);
    session.disconnect();
    Ok(SUCCESS)
}
