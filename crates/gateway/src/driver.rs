//! JSON-lines request loop.
//!
//! Each input line is a [`GatewayRequest`]; each output line is a
//! [`DriverResponse`]. Blank lines are skipped.

use crate::error::ErrorCode;
use crate::pipeline::{GatewayRequest, Pipeline};
use credit_ledger::to_credits;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::signal;
use tracing::{error, info, warn};

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_charged: Option<f64>,
}

impl DriverResponse {
    fn invalid(message: String) -> Self {
        Self {
            ok: false,
            reply: None,
            code: None,
            message: Some(message),
            credits_charged: None,
        }
    }
}

/// Parse and run a single input line.
pub async fn handle_line(pipeline: &Pipeline, line: &str) -> DriverResponse {
    let request: GatewayRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed request line: {}", e);
            return DriverResponse::invalid(format!("invalid request: {}", e));
        }
    };

    match pipeline.handle(&request).await {
        Ok(reply) => DriverResponse {
            ok: true,
            reply: Some(reply.content),
            code: None,
            message: None,
            credits_charged: Some(to_credits(reply.credits_charged)),
        },
        Err(e) => {
            error!("Request for {} failed: {}", request.user_id, e);
            DriverResponse {
                ok: false,
                reply: None,
                code: Some(e.code()),
                message: Some(e.user_message()),
                credits_charged: None,
            }
        }
    }
}

/// Serve requests from `reader` until EOF or Ctrl-C.
pub async fn run<R, W>(pipeline: &Pipeline, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let response = handle_line(pipeline, &line).await;
                let mut out = serde_json::to_string(&response)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
