#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lkv_client::NodeConfig;
use tracing_subscriber::EnvFilter;

/// Routes driver logs through the test harness; `RUST_LOG=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One command as seen by the server.
pub struct Request {
    /// Accept order of the connection, from 0.
    pub conn: usize,
    /// Command order within the connection, from 0.
    pub seq: usize,
    pub args: Vec<Vec<u8>>,
}

impl Request {
    pub fn command(&self) -> &[u8] {
        self.args.first().map(Vec::as_slice).unwrap_or(&[])
    }
}

pub enum Response {
    Frames(Vec<Vec<u8>>),
    /// Close the socket without answering.
    Hangup,
}

impl Response {
    pub fn status(status: &str, values: &[&[u8]]) -> Response {
        let mut frames = vec![status.as_bytes().to_vec()];
        frames.extend(values.iter().map(|value| value.to_vec()));
        Response::Frames(frames)
    }
}

type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Thread-per-connection server speaking the length-prefixed block protocol.
pub struct MockServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockServer {
    pub fn spawn(handler: impl Fn(&Request) -> Response + Send + Sync + 'static) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        {
            let accepted = Arc::clone(&accepted);
            let commands = Arc::clone(&commands);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(_) => break,
                    };
                    let conn = accepted.fetch_add(1, Ordering::SeqCst);
                    let handler = Arc::clone(&handler);
                    let commands = Arc::clone(&commands);
                    thread::spawn(move || serve(conn, stream, handler, commands));
                }
            });
        }

        MockServer {
            port,
            accepted,
            commands,
        }
    }

    /// In-memory store answering `set`, `get`, `del`, `incr` and `info`.
    ///
    /// With a password, every command other than `auth` needs a prior
    /// successful `auth` on the same connection.
    pub fn kv(password: Option<&'static str>) -> MockServer {
        let store: Mutex<HashMap<Vec<u8>, Vec<u8>>> = Mutex::new(HashMap::new());
        let authed: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
        MockServer::spawn(move |req| {
            if req.command() == b"auth" {
                return match (password, req.args.get(1)) {
                    (Some(expected), Some(given)) if expected.as_bytes() == given.as_slice() => {
                        authed.lock().unwrap().insert(req.conn);
                        Response::status("ok", &[b"1"])
                    }
                    _ => Response::status("error", &[b"invalid password"]),
                };
            }
            if password.is_some() && !authed.lock().unwrap().contains(&req.conn) {
                return Response::status("noauth", &[b"authentication required"]);
            }
            kv_command(&store, req)
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Node configuration pointing at this server with short timeouts.
    pub fn node(&self) -> NodeConfig {
        NodeConfig {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            ..NodeConfig::new("127.0.0.1", self.port)
        }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Command names received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect()
    }
}

fn kv_command(store: &Mutex<HashMap<Vec<u8>, Vec<u8>>>, req: &Request) -> Response {
    let mut store = store.lock().unwrap();
    match (req.command(), &req.args[1..]) {
        (b"info", _) => Response::status("ok", &[b"version", b"mock"]),
        (b"set", [key, value]) => {
            store.insert(key.clone(), value.clone());
            Response::status("ok", &[b"1"])
        }
        (b"get", [key]) => match store.get(key) {
            Some(value) => Response::status("ok", &[value.as_slice()]),
            None => Response::status("not_found", &[]),
        },
        (b"del", [key]) => {
            store.remove(key);
            Response::status("ok", &[b"1"])
        }
        (b"incr", [key, by]) => {
            let by: i64 = String::from_utf8_lossy(by).parse().unwrap_or(0);
            let current: i64 = store
                .get(key)
                .map(|value| String::from_utf8_lossy(value).parse().unwrap_or(0))
                .unwrap_or(0);
            let next = (current + by).to_string().into_bytes();
            store.insert(key.clone(), next.clone());
            Response::status("ok", &[next.as_slice()])
        }
        _ => Response::status("client_error", &[b"unknown command"]),
    }
}

fn serve(conn: usize, stream: TcpStream, handler: Handler, commands: Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut seq = 0;

    while let Ok(Some(args)) = read_command(&mut reader) {
        let req = Request { conn, seq, args };
        commands.lock().unwrap().push(req.command().to_vec());
        seq += 1;

        match handler(&req) {
            Response::Frames(frames) => {
                let mut out = Vec::new();
                for frame in frames {
                    out.extend_from_slice(frame.len().to_string().as_bytes());
                    out.push(b'\n');
                    out.extend_from_slice(&frame);
                    out.push(b'\n');
                }
                out.push(b'\n');
                if writer.write_all(&out).is_err() {
                    return;
                }
            }
            Response::Hangup => {
                let _ = writer.shutdown(Shutdown::Both);
                return;
            }
        }
    }
}

/// Reads one command block; `None` on a clean disconnect.
fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut args = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            if args.is_empty() {
                continue;
            }
            return Ok(Some(args));
        }
        let len: usize = header
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length"))?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut newline = [0u8; 1];
        reader.read_exact(&mut newline)?;
        if newline[0] == b'\r' {
            reader.read_exact(&mut newline)?;
        }
        args.push(data);
    }
}
