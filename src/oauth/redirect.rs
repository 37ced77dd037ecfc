use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

/// Query parameters the provider appends to the redirect URI.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct Capture {
    expected_state: String,
    tx: Arc<Mutex<mpsc::Sender<anyhow::Result<String>>>>,
}

/// Runs a one-shot local listener for the OAuth redirect and returns the
/// authorization code. The `state` parameter must round-trip unchanged or the
/// callback is rejected. Times out after `timeout` if the user never
/// completes consent.
pub async fn capture_code(
    addr: SocketAddr,
    expected_state: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let (tx, mut rx) = mpsc::channel(1);
    let capture = Capture {
        expected_state: expected_state.to_string(),
        tx: Arc::new(Mutex::new(tx)),
    };

    let app = Router::new().route("/callback", get(callback)).with_state(capture);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let result = tokio::select! {
        received = rx.recv() => match received {
            Some(result) => result,
            None => Err(anyhow::anyhow!("redirect listener closed unexpectedly")),
        },
        _ = tokio::time::sleep(timeout) => {
            Err(anyhow::anyhow!("timed out waiting for authorization redirect"))
        }
    };

    server.abort();

    result
}

async fn callback(
    State(capture): State<Capture>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let outcome = match params {
        CallbackParams { error: Some(e), .. } => Err(anyhow::anyhow!("consent denied: {}", e)),
        CallbackParams {
            code: Some(code),
            state: Some(state),
            ..
        } if state == capture.expected_state => Ok(code),
        CallbackParams { state: Some(_), .. } => {
            Err(anyhow::anyhow!("state mismatch on redirect, possible CSRF"))
        }
        _ => Err(anyhow::anyhow!("redirect missing code or state parameter")),
    };

    let body = if outcome.is_ok() {
        "Authorization complete. You can close this window."
    } else {
        "Authorization failed. Check the terminal for details."
    };

    // A second hit after the channel is consumed is ignored.
    let tx = capture.tx.lock().await;
    tx.try_send(outcome).ok();

    Html(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_code_from_redirect() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Bind on a fixed ephemeral port chosen by the OS, then hit it.
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let capture = tokio::spawn(async move {
            capture_code(bound, "state-1", Duration::from_secs(5)).await
        });
        // Give the listener a moment to bind before the "browser" redirects.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let resp = reqwest::get(format!(
            "http://{}/callback?code=auth-code-1&state=state-1",
            bound
        ))
        .await
        .unwrap();
        assert!(resp.status().is_success());

        assert_eq!(capture.await.unwrap().unwrap(), "auth-code-1");
    }

    #[tokio::test]
    async fn rejects_mismatched_state() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let capture = tokio::spawn(async move {
            capture_code(bound, "state-1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        reqwest::get(format!(
            "http://{}/callback?code=auth-code-1&state=attacker",
            bound
        ))
        .await
        .unwrap();

        assert!(capture.await.unwrap().is_err());
    }
}
