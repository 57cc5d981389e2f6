use std::sync::Arc;

use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use mgrpc_codec::CredsCallback;
use mgrpc_frame::Request;
use mgrpc_session::{Session, SessionOptions};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{session_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, USAGE};
use crate::output::{print_response, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let params = match &args.params {
        Some(text) => Some(
            RawValue::from_string(text.clone())
                .map_err(|err| CliError::new(DATA_INVALID, format!("invalid params: {err}")))?,
        ),
        None => None,
    };

    let creds = args.creds.as_deref().map(parse_creds).transpose()?;

    let mut opts = SessionOptions {
        local_id: args.src.clone(),
        key: args.key.clone(),
        reconnect: args.reconnect,
        call_timeout: timeout,
        ..Default::default()
    };
    opts.codec.serial.baud_rate = args.baud;
    if args.print_junk {
        opts.junk_handler = Some(Arc::new(|data: &[u8]| {
            eprint!("{}", String::from_utf8_lossy(data));
        }));
    }

    let session = Session::connect(&args.address, opts)
        .await
        .map_err(|err| session_error("connect failed", err))?;

    // ^C cancels the in-flight call instead of killing the process
    // mid-write.
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.cancel();
            }
        });
    }

    let req = Request {
        method: args.method.clone(),
        args: params,
        timeout: timeout.as_secs() as i64,
        no_response: args.no_response,
        ..Default::default()
    };

    let resp = session
        .call(&ctx, &args.dst, req, creds)
        .await
        .map_err(|err| session_error("call failed", err))?;

    if args.no_response {
        return Ok(SUCCESS);
    }

    if resp.status != 0 {
        let detail = if resp.status_msg.is_empty() {
            format!("device returned status {}", resp.status)
        } else {
            format!("device returned status {}: {}", resp.status, resp.status_msg)
        };
        return Err(CliError::new(FAILURE, detail));
    }

    print_response(&resp, format);
    Ok(SUCCESS)
}

fn parse_creds(input: &str) -> CliResult<CredsCallback> {
    let (user, pass) = input
        .split_once(':')
        .ok_or_else(|| CliError::new(USAGE, "credentials must be USER:PASS"))?;
    let user = user.to_string();
    let pass = pass.to_string();
    Ok(Arc::new(move || Ok((user.clone(), pass.clone()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creds_require_a_separator() {
        assert!(parse_creds("justuser").is_err());
    }

    #[test]
    fn creds_split_on_first_colon() {
        let cb = parse_creds("admin:s3:cret").expect("creds should parse");
        let (user, pass) = cb().expect("callback should yield creds");
        assert_eq!(user, "admin");
        assert_eq!(pass, "s3:cret");
    }
}
