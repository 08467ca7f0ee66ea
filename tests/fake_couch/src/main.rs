//! Fake CouchDB for integration testing
//!
//! Accepts the couchdb command line (`-n -a <ini> ... -p <pidfile>`) and
//! listens on `[httpd] port`. Later ini files override earlier ones.
//!
//! Behaviour is tuned per instance through a `[fake_couch]` ini section:
//! - version: reported by `GET /` (default: 1.6.1)
//! - startup_delay_ms: delay before listening (default: 0)
//! - db_updates: `false` answers `/_db_updates` with 400 (default: true)

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut ini_files = Vec::new();
    let mut pid_file = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-a" => ini_files.extend(iter.next().cloned()),
            "-p" => pid_file = iter.next().cloned(),
            _ => {}
        }
    }

    let mut settings = HashMap::new();
    for path in &ini_files {
        if let Ok(contents) = std::fs::read_to_string(path) {
            parse_ini(&contents, &mut settings);
        }
    }
    let get = |section: &str, key: &str| {
        settings
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    };

    let port: u16 = get("httpd", "port")
        .and_then(|v| v.parse().ok())
        .expect("no [httpd] port in the ini files");
    let behaviour = Arc::new(Behaviour {
        version: get("fake_couch", "version").unwrap_or_else(|| "1.6.1".to_string()),
        db_updates: get("fake_couch", "db_updates").as_deref() != Some("false"),
    });

    if let Some(path) = pid_file {
        let _ = std::fs::write(path, format!("{}\n", std::process::id()));
    }

    let startup_delay: u64 = get("fake_couch", "startup_delay_ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("Fake couch: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");
    eprintln!("Fake couch: listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, Arc::clone(&behaviour)));
            }
            Err(e) => eprintln!("Fake couch: accept error: {}", e),
        }
    }
}

struct Behaviour {
    version: String,
    db_updates: bool,
}

fn parse_ini(ini: &str, settings: &mut HashMap<(String, String), String>) {
    let mut section = String::new();
    for line in ini.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
        } else if let Some((key, value)) = line.split_once('=') {
            settings.insert(
                (section.clone(), key.trim().to_string()),
                value.trim().to_string(),
            );
        }
    }
}

async fn handle_connection(mut stream: TcpStream, behaviour: Arc<Behaviour>) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let mut parts = request.lines().next().unwrap_or("").split(' ');
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();
    eprintln!("Fake couch: {} {}", method, path);

    let (status, body) = match path.split('?').next().unwrap_or("/") {
        "/" => (
            "200 OK",
            format!(
                r#"{{"couchdb":"Welcome","version":"{}"}}"#,
                behaviour.version
            ),
        ),
        "/_db_updates" if !behaviour.db_updates => (
            "400 Bad Request",
            r#"{"error":"bad_request","reason":"Unsupported"}"#.to_string(),
        ),
        "/_db_updates" => ("200 OK", r#"{"results":[]}"#.to_string()),
        _ => (
            "200 OK",
            format!(r#"{{"method":"{}","path":"{}"}}"#, method, path),
        ),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
