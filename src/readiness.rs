use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn server_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

/// Polls `url` until any HTTP response arrives. RStudio answers with a
/// redirect to its sign-in page, so the status code is not inspected.
/// Running out of attempts is reported, never raised.
pub fn wait_for_server(url: &str, attempts: u32, interval: Duration) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "could not build http client for readiness check");
            return false;
        }
    };
    for attempt in 1..=attempts.max(1) {
        match client.get(url).send() {
            Ok(resp) => {
                info!(url = %url, status = resp.status().as_u16(), attempt, "server is responding");
                return true;
            }
            Err(err) => debug!(url = %url, attempt, error = %err, "server not ready yet"),
        }
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    warn!(url = %url, attempts, "server did not respond in time; it may still be starting");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn any_response_counts_as_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 302 Found\r\nLocation: /auth-sign-in\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
        });
        assert!(wait_for_server(&server_url("127.0.0.1", port), 3, Duration::ZERO));
        handle.join().unwrap();
    }

    #[test]
    fn closed_port_times_out_without_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!wait_for_server(&server_url("127.0.0.1", port), 2, Duration::ZERO));
    }
}
