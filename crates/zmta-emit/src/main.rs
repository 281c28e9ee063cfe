use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::process::ExitCode;

use serde_json::Value;
use zmta_proto::{Action, WireEvent, encode_event};

const EX_TEMPFAIL: u8 = 75;
const EX_USAGE: u8 = 64;
const USAGE: &str = "usage: zmta-emit --server host:port --id ID [--seq SEQ] --action ACTION [--field key=value]...";

type Result<T> = std::result::Result<T, EmitError>;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                EmitError::Usage(_) => EX_USAGE,
                EmitError::Runtime(_) => EX_TEMPFAIL,
            };
            eprintln!("zmta-emit error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse(std::env::args().skip(1))?;
    let payload = build_payload(&cli)?;
    let addr = resolve_socket_addr(&cli.server)?;
    send_datagram(addr, &payload)
}

fn build_payload(cli: &Cli) -> Result<Vec<u8>> {
    let mut event = WireEvent::new(cli.id.clone()).with_action(cli.action.clone());
    if let Some(seq) = &cli.seq {
        event = event.with_seq(seq.clone());
    }
    for (key, value) in &cli.fields {
        event = event.with_field(key.clone(), value.clone());
    }
    encode_event(&event).map_err(|err| runtime_err("failed to encode event", err))
}

fn send_datagram(
    addr: SocketAddr,
    payload: &[u8]
) -> Result<()> {
    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local)
        .map_err(|err| runtime_err("failed to bind local udp socket", err))?;
    let sent = socket
        .send_to(payload, addr)
        .map_err(|err| runtime_err(format!("failed to send datagram to {addr}"), err))?;
    if sent != payload.len() {
        return Err(EmitError::Runtime(format!(
            "short datagram write: {sent} of {} bytes",
            payload.len()
        )));
    }
    Ok(())
}

fn resolve_socket_addr(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .map_err(|err| {
            runtime_err(format!("failed to resolve server address: {server}"), err)
        })?
        .next()
        .ok_or_else(|| {
            EmitError::Runtime(format!("no address resolved for server: {server}"))
        })
}

#[derive(Debug)]
struct Cli {
    server: String,
    id: String,
    seq: Option<String>,
    action: Action,
    fields: Vec<(String, Value)>,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut server = None;
        let mut id = None;
        let mut seq = None;
        let mut action = None;
        let mut fields = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => server = args.next(),
                "--id" => id = args.next(),
                "--seq" => seq = args.next(),
                "--action" => action = args.next(),
                "--field" => {
                    let raw = args.next().ok_or_else(|| {
                        EmitError::Usage("missing value for --field".to_string())
                    })?;
                    fields.push(parse_field(&raw)?);
                }
                "-h" | "--help" => return Err(EmitError::Usage(USAGE.to_string())),
                _ => {
                    return Err(EmitError::Usage(format!("unknown argument: {arg}")));
                }
            }
        }

        let action = action
            .filter(|action| !action.trim().is_empty())
            .ok_or_else(|| missing("--action"))?;
        let Ok(action) = action.trim().to_uppercase().parse::<Action>();

        Ok(Self {
            server: server.ok_or_else(|| missing("--server"))?,
            id: id.filter(|id| !id.is_empty()).ok_or_else(|| missing("--id"))?,
            seq: seq.filter(|seq| !seq.is_empty()),
            action,
            fields,
        })
    }
}

/// `key=value`; integer values are sent as numbers, everything else as text.
fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .ok_or_else(|| EmitError::Usage(format!("--field expects key=value: {raw}")))?;

    let value = match value.parse::<i64>() {
        Ok(number) => Value::from(number),
        Err(_) => Value::String(value.to_string()),
    };
    Ok((key.trim().to_string(), value))
}

fn missing(flag: &str) -> EmitError {
    EmitError::Usage(format!("missing required argument {flag}"))
}

#[derive(Debug)]
enum EmitError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for EmitError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        match self {
            EmitError::Usage(msg) => write!(f, "{msg}"),
            EmitError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EmitError {}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display
) -> EmitError {
    EmitError::Runtime(format!("{}: {err}", context.into()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use zmta_proto::decode_event;

    use super::*;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter().map(|arg| arg.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn cli_parse_collects_fields() {
        let cli = Cli::parse(args(&[
            "--server",
            "127.0.0.1:31239",
            "--id",
            "17a4a3b8c3f0000a1b",
            "--seq",
            "001",
            "--action",
            "queued",
            "--field",
            "message-id=<m@example.com>",
            "--field",
            "size=2048",
        ]))
        .expect("parse should succeed");

        assert_eq!(cli.server, "127.0.0.1:31239");
        assert_eq!(cli.seq.as_deref(), Some("001"));
        assert_eq!(cli.action, Action::Queued);
        assert_eq!(cli.fields[0], ("message-id".to_string(), json!("<m@example.com>")));
        assert_eq!(cli.fields[1], ("size".to_string(), json!(2048)));
    }

    #[test]
    fn cli_parse_requires_action() {
        let err = Cli::parse(args(&["--server", "127.0.0.1:1", "--id", "abc"]))
            .expect_err("parse should fail");
        match err {
            EmitError::Usage(msg) => assert!(msg.contains("--action")),
            _ => panic!("expected usage error"),
        }
    }

    #[test]
    fn malformed_field_is_usage_error() {
        assert!(matches!(parse_field("no-separator"), Err(EmitError::Usage(_))));
        assert!(matches!(parse_field("=value"), Err(EmitError::Usage(_))));
        assert_eq!(parse_field("to=a@x,b@y").unwrap().1, json!("a@x,b@y"));
    }

    #[test]
    fn datagram_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").expect("bind listener");
        listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = listener.local_addr().unwrap();

        let cli = Cli::parse(args(&[
            "--server",
            &addr.to_string(),
            "--id",
            "17a4a3b8c3f0000a1b",
            "--action",
            "DEFERRED",
            "--field",
            "response=451 try later",
        ]))
        .unwrap();
        send_datagram(addr, &build_payload(&cli).unwrap()).expect("send");

        let mut buf = [0u8; 2048];
        let (len, _) = listener.recv_from(&mut buf).expect("datagram");
        let event = decode_event(&buf[..len]).expect("decode");
        assert_eq!(event.id, "17a4a3b8c3f0000a1b");
        assert_eq!(event.action, Some(Action::Deferred));
        assert_eq!(event.field_text("response").as_deref(), Some("451 try later"));
    }
}
