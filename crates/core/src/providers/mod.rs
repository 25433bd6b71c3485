mod ollama;
mod openai;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use crate::error::GenerationError;
use reqwest::StatusCode;
use std::time::Duration;

fn transport_error(provider: &str, error: reqwest::Error, after: Duration) -> GenerationError {
    if error.is_timeout() {
        GenerationError::Timeout {
            provider: provider.to_string(),
            after,
        }
    } else if error.is_decode() {
        GenerationError::InvalidResponse {
            provider: provider.to_string(),
            details: error.to_string(),
        }
    } else {
        GenerationError::ProviderUnavailable {
            provider: provider.to_string(),
            reason: error.to_string(),
        }
    }
}

fn status_error(provider: &str, status: StatusCode, body: &str) -> GenerationError {
    let provider = provider.to_string();
    let details = format!("{status}: {}", body.chars().take(300).collect::<String>());
    let lowered = body.to_lowercase();
    let mentions_length = ["context length", "context_length", "too long", "too large", "maximum context"]
        .iter()
        .any(|needle| lowered.contains(needle));

    match status {
        StatusCode::PAYLOAD_TOO_LARGE => GenerationError::RequestTooLarge { provider, details },
        StatusCode::BAD_REQUEST if mentions_length => {
            GenerationError::RequestTooLarge { provider, details }
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GenerationError::InvalidResponse { provider, details }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerationError::Timeout {
            provider,
            after: Duration::ZERO,
        },
        _ => GenerationError::ProviderUnavailable {
            provider,
            reason: details,
        },
    }
}

fn non_empty(provider: &str, text: Option<String>) -> Result<String, GenerationError> {
    match text.map(|text| text.trim().to_string()) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(GenerationError::InvalidResponse {
            provider: provider.to_string(),
            details: "response contained no text".to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    /// Answers every request with `status` and a JSON `body`, recording the
    /// request bodies it received.
    pub async fn canned(
        status: &'static str,
        body: &'static str,
    ) -> std::io::Result<(SocketAddr, Arc<Mutex<Vec<String>>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await.unwrap_or_default();
                recorder.lock().await.push(request);
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Ok((address, seen))
    }

    /// Accepts connections and never answers.
    pub async fn silent() -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Ok(address)
    }

    async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&buffer);
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buffer.len() >= split + 4 + length {
                    return Ok(String::from_utf8_lossy(&buffer[split + 4..]).into_owned());
                }
            }
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
