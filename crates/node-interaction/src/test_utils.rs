//! An in-process JSON-RPC server that stands in for a node in tests.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
};

use serde_json::{Value, json};

/// Answers JSON-RPC requests on a local port from a background thread, one connection at a time.
/// The thread lives until the test process exits.
#[derive(Debug)]
pub struct RpcStub {
    port: u16,
}

impl RpcStub {
    /// Serves every request with `handler(method, params)`. An `Err` is sent back as a JSON-RPC
    /// error object carrying the message.
    pub fn serve<F>(mut handler: F) -> io::Result<Self>
    where
        F: FnMut(&str, &Value) -> Result<Value, String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let _ = answer(stream, &mut handler);
            }
        });
        Ok(Self { port })
    }

    /// Serves the block queries of a chain whose heights the test changes through `chain`.
    pub fn chain(chain: Arc<Mutex<StubChain>>) -> io::Result<Self> {
        Self::serve(move |method, params| {
            let chain = *chain
                .lock()
                .map_err(|_| "chain state poisoned".to_owned())?;
            chain.answer(method, params)
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// The heights a [`RpcStub::chain`] reports. A `None` height makes the matching head query fail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StubChain {
    pub best: Option<u64>,
    pub finalized: Option<u64>,
}

impl StubChain {
    pub fn new(best: u64, finalized: u64) -> Self {
        Self {
            best: Some(best),
            finalized: Some(finalized),
        }
    }

    /// Shared state to hand to [`RpcStub::chain`].
    pub fn shared(best: u64, finalized: u64) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(best, finalized)))
    }

    /// The hash of the block at `height`. The height can be read back from it.
    pub fn hash(height: u64) -> String {
        format!("0x{height:064x}")
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, String> {
        match method {
            "chain_getBlockHash" => match params.get(0).and_then(Value::as_u64) {
                Some(height) => Ok(json!(Self::hash(height))),
                None => self
                    .best
                    .map(|height| json!(Self::hash(height)))
                    .ok_or_else(|| "best block unavailable".to_owned()),
            },
            "chain_getFinalizedHead" => self
                .finalized
                .map(|height| json!(Self::hash(height)))
                .ok_or_else(|| "finalized head unavailable".to_owned()),
            "chain_getBlock" => {
                let height = params
                    .get(0)
                    .and_then(Value::as_str)
                    .and_then(|hash| u64::from_str_radix(hash.trim_start_matches("0x"), 16).ok())
                    .ok_or_else(|| format!("unknown block {params}"))?;
                Ok(json!({
                    "block": {"header": {"number": format!("0x{height:x}")}},
                    "justifications": null
                }))
            }
            other => Err(format!("method {other} not found")),
        }
    }
}

fn answer<F>(stream: TcpStream, handler: &mut F) -> io::Result<()>
where
    F: FnMut(&str, &Value) -> Result<Value, String>,
{
    let mut reader = BufReader::new(stream);
    let mut content_length = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or_default();
            }
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body)?;

    let request: Value = serde_json::from_slice(&body).unwrap_or_default();
    let method = request["method"].as_str().unwrap_or_default();
    let params = request.get("params").cloned().unwrap_or_default();
    let id = request["id"].clone();
    let mut response = json!({"jsonrpc": "2.0", "id": id});
    match handler(method, &params) {
        Ok(result) => response["result"] = result,
        Err(message) => response["error"] = json!({"code": -32000, "message": message}),
    }

    let body = response.to_string();
    let mut stream = reader.into_inner();
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}
