/// Ephemeral loopback HTTP listener for the native OAuth redirect
/// (RFC 8252 section 7.3).
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Query parameters captured from the provider redirect.
#[derive(Debug, Clone, Default)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// One-shot callback capture server bound to 127.0.0.1.
///
/// Serves a waiting page at `/` and captures the first request to
/// `/callback`; later hits still get a friendly page so the browser never
/// sees a connection error, but they are ignored for state purposes.
pub struct CallbackServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    receiver: Mutex<Option<mpsc::Receiver<CallbackResult>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    redirect_uri: Mutex<Option<String>>,
}

impl CallbackServer {
    /// `port` 0 asks the OS for an ephemeral port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            shutdown: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            handle: Mutex::new(None),
            redirect_uri: Mutex::new(None),
        }
    }

    /// Bind the listener and start the accept loop on a dedicated thread.
    /// Returns the redirect URI to hand to the provider.
    pub fn start(&self) -> Result<String> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .context("Failed to bind loopback callback server")?;
        let port = listener.local_addr()?.port();

        // Short accept timeout keeps stop() responsive
        listener
            .set_nonblocking(true)
            .context("Failed to configure callback listener")?;

        let (tx, rx) = mpsc::channel();
        let shutdown = self.shutdown.clone();

        let handle = thread::Builder::new()
            .name("oauth-callback".to_string())
            .spawn(move || accept_loop(listener, tx, shutdown))
            .context("Failed to spawn callback server thread")?;

        let redirect_uri = format!("http://127.0.0.1:{}/callback", port);
        debug!("Callback server listening at {}", redirect_uri);

        *self.receiver.lock().unwrap() = Some(rx);
        *self.handle.lock().unwrap() = Some(handle);
        *self.redirect_uri.lock().unwrap() = Some(redirect_uri.clone());

        Ok(redirect_uri)
    }

    /// Block until a callback arrives or `timeout` elapses. `None` on timeout.
    pub fn wait_for_callback(&self, timeout: Duration) -> Option<CallbackResult> {
        let guard = self.receiver.lock().unwrap();
        let rx = guard.as_ref()?;
        rx.recv_timeout(timeout).ok()
    }

    /// Stop the accept loop. Idempotent; safe before `start()`.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, tx: mpsc::Sender<CallbackResult>, shutdown: Arc<AtomicBool>) {
    let mut captured = false;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_request(stream, &tx, &mut captured) {
                    warn!("Callback request handling failed: {}", e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!("Callback server accept error: {}", e);
                break;
            }
        }
    }
}

fn handle_request(
    stream: TcpStream,
    tx: &mpsc::Sender<CallbackResult>,
    captured: &mut bool,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain headers; nothing in them matters for a loopback redirect
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };

    let mut stream = reader.into_inner();

    match path {
        "/callback" => {
            let result = parse_callback_query(query.unwrap_or(""));

            if *captured {
                respond(&mut stream, 200, &already_done_page())?;
                return Ok(());
            }
            *captured = true;

            let page = if let Some(error) = &result.error {
                let description = result.error_description.as_deref().unwrap_or("");
                error_page(error, description)
            } else {
                success_page()
            };
            respond(&mut stream, 200, &page)?;

            // Receiver may already be gone if the flow timed out
            let _ = tx.send(result);
        }
        "/" => respond(&mut stream, 200, &waiting_page())?,
        _ => respond(&mut stream, 404, &not_found_page())?,
    }

    Ok(())
}

fn parse_callback_query(query: &str) -> CallbackResult {
    let mut result = CallbackResult::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => result.code = Some(value.into_owned()),
            "state" => result.state = Some(value.into_owned()),
            "error" => result.error = Some(value.into_owned()),
            "error_description" => result.error_description = Some(value.into_owned()),
            _ => {}
        }
    }
    result
}

fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "OK",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Content-Security-Policy: default-src 'none'; style-src 'unsafe-inline'\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Escape a value for interpolation into HTML text content. Redirect
/// parameters are attacker-influenced and must never reach the page raw.
fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{}</title>\
         <style>body{{font-family:sans-serif;margin:4em auto;max-width:32em;text-align:center}}</style>\
         </head><body><h1>{}</h1><p>{}</p></body></html>",
        title, title, message
    )
}

fn waiting_page() -> String {
    page("Signing in", "Waiting for the identity provider to redirect back...")
}

fn success_page() -> String {
    page("Signed in", "Authentication complete. You can close this window.")
}

fn error_page(error: &str, description: &str) -> String {
    page(
        "Sign-in failed",
        &format!("{}: {}", html_escape(error), html_escape(description)),
    )
}

fn already_done_page() -> String {
    page("Already signed in", "This sign-in attempt was already completed.")
}

fn not_found_page() -> String {
    page("Not found", "Nothing to see here.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callback_query() {
        let result = parse_callback_query("code=abc&state=xyz");
        assert_eq!(result.code.as_deref(), Some("abc"));
        assert_eq!(result.state.as_deref(), Some("xyz"));
        assert!(result.error.is_none());

        let result = parse_callback_query("error=access_denied&error_description=User%20said%20no");
        assert_eq!(result.error.as_deref(), Some("access_denied"));
        assert_eq!(result.error_description.as_deref(), Some("User said no"));
        assert!(result.code.is_none());
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"
        );
        assert_eq!(html_escape("a & b \"c\""), "a &amp; b &quot;c&quot;");
    }

    #[test]
    fn test_error_page_escapes_description() {
        let body = error_page("bad", "<script>alert(1)</script>");
        assert!(!body.contains("<script>alert"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_stop_before_start_is_safe() {
        let server = CallbackServer::new(0);
        server.stop();
        server.stop();
    }

    #[test]
    fn test_start_returns_callback_uri() {
        let server = CallbackServer::new(0);
        let uri = server.start().unwrap();
        assert!(uri.starts_with("http://127.0.0.1:"));
        assert!(uri.ends_with("/callback"));
        server.stop();
    }

    #[test]
    fn test_wait_times_out_without_callback() {
        let server = CallbackServer::new(0);
        server.start().unwrap();
        let result = server.wait_for_callback(Duration::from_millis(50));
        assert!(result.is_none());
        server.stop();
    }

    #[test]
    fn test_first_callback_wins() {
        let server = CallbackServer::new(0);
        let uri = server.start().unwrap();
        let port: u16 = uri
            .trim_start_matches("http://127.0.0.1:")
            .trim_end_matches("/callback")
            .parse()
            .unwrap();

        let send = |query: &str| {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            write!(stream, "GET /callback?{} HTTP/1.1\r\nHost: x\r\n\r\n", query).unwrap();
            let mut response = String::new();
            let mut reader = BufReader::new(stream);
            while let Ok(n) = reader.read_line(&mut response) {
                if n == 0 {
                    break;
                }
            }
            response
        };

        send("code=first&state=s1");
        send("code=second&state=s2");

        let captured = server.wait_for_callback(Duration::from_secs(2)).unwrap();
        assert_eq!(captured.code.as_deref(), Some("first"));

        // The second hit was answered but never captured
        assert!(server.wait_for_callback(Duration::from_millis(50)).is_none());
        server.stop();
    }
}
