//! SAM reply-line parser
//!
//! Replies are single `\n`-terminated ASCII lines: a two-word prefix
//! (`HELLO REPLY`, `SESSION STATUS`, ...) followed by space-separated
//! `KEY=VALUE` pairs. Parsing is pure and stateless.

/// Reply kinds recognised from the two-word prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyKind {
    HelloReply,
    SessionStatus,
    StreamStatus,
    NamingReply,
    DestReply,
    #[default]
    Unknown,
}

/// `RESULT=` codes the bridge may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultCode {
    Ok,
    DuplicatedDest,
    DuplicatedId,
    I2pError,
    InvalidId,
    InvalidKey,
    CantReachPeer,
    Timeout,
    NoVersion,
    KeyNotFound,
    AlreadyAccepting,
    Failed,
    #[default]
    Unknown,
}

/// One parsed SAM reply line
#[derive(Debug, Clone, Default)]
pub struct ReplyMessage {
    pub kind: ReplyKind,
    pub result: ResultCode,
    /// The input line with trailing newline characters stripped
    pub original_line: String,
    /// Value of `MESSAGE=`, if any
    pub message_text: String,

    // NAMING_REPLY
    pub name: String,
    pub value: String,

    // DEST_REPLY
    pub pub_key: String,
    pub priv_key: String,

    /// SESSION STATUS OK: our own `DESTINATION=`.
    /// STREAM STATUS OK: the peer's `FROM_DESTINATION=`.
    pub destination_field: String,
}

/// Extract the value of `key` from a reply line.
///
/// Finds `KEY=` at a token boundary and reads up to the next space or end
/// of line. Returns the empty string when the key is absent. Values are
/// not quote-stripped: a quoted multi-word `MESSAGE="a b"` yields `"a`.
pub fn value_for_key(line: &str, key: &str) -> String {
    if key.is_empty() || line.is_empty() {
        return String::new();
    }
    let pattern = format!("{}=", key);
    let mut search_from = 0;
    while let Some(offset) = line[search_from..].find(&pattern) {
        let start = search_from + offset;
        // Only accept the key at the start of a token
        if start == 0 || line.as_bytes()[start - 1] == b' ' {
            let value_start = start + pattern.len();
            let rest = &line[value_start..];
            let value_end = rest.find(' ').unwrap_or(rest.len());
            return rest[..value_end].to_string();
        }
        search_from = start + pattern.len();
    }
    String::new()
}

fn parse_result_code(result: &str) -> ResultCode {
    match result {
        "OK" => ResultCode::Ok,
        "DUPLICATED_DEST" => ResultCode::DuplicatedDest,
        "DUPLICATED_ID" => ResultCode::DuplicatedId,
        "I2P_ERROR" => ResultCode::I2pError,
        "INVALID_ID" => ResultCode::InvalidId,
        "INVALID_KEY" => ResultCode::InvalidKey,
        "CANT_REACH_PEER" => ResultCode::CantReachPeer,
        "TIMEOUT" => ResultCode::Timeout,
        "NOVERSION" => ResultCode::NoVersion,
        "KEY_NOT_FOUND" => ResultCode::KeyNotFound,
        "ALREADY_ACCEPTING" => ResultCode::AlreadyAccepting,
        "FAILED" => ResultCode::Failed,
        _ => ResultCode::Unknown,
    }
}

/// Parse one SAM reply line into a [`ReplyMessage`].
///
/// Trailing `\n` and `\r` are stripped first. Lines with fewer than two
/// tokens come back as [`ReplyKind::Unknown`].
pub fn parse_reply(reply_line: &str) -> ReplyMessage {
    let line = reply_line.trim_end_matches('\n').trim_end_matches('\r');

    let mut msg = ReplyMessage {
        original_line: line.to_string(),
        ..ReplyMessage::default()
    };

    let mut tokens = line.split(' ');
    let first = tokens.next().unwrap_or("").to_ascii_uppercase();
    let second = match tokens.next() {
        Some(t) if !t.is_empty() => t.to_ascii_uppercase(),
        _ => return msg,
    };

    msg.message_text = value_for_key(line, "MESSAGE");
    let result_str = value_for_key(line, "RESULT");

    match (first.as_str(), second.as_str()) {
        ("HELLO", "REPLY") => {
            msg.kind = ReplyKind::HelloReply;
            msg.result = parse_result_code(&result_str);
        }
        ("SESSION", "STATUS") => {
            msg.kind = ReplyKind::SessionStatus;
            msg.result = parse_result_code(&result_str);
            if msg.result == ResultCode::Ok {
                msg.destination_field = value_for_key(line, "DESTINATION");
            }
        }
        ("STREAM", "STATUS") => {
            msg.kind = ReplyKind::StreamStatus;
            msg.result = parse_result_code(&result_str);
            if msg.result == ResultCode::Ok {
                msg.destination_field = value_for_key(line, "FROM_DESTINATION");
            }
        }
        ("NAMING", "REPLY") => {
            msg.kind = ReplyKind::NamingReply;
            msg.result = parse_result_code(&result_str);
            msg.name = value_for_key(line, "NAME");
            msg.value = value_for_key(line, "VALUE");
        }
        ("DEST", "REPLY") => {
            msg.kind = ReplyKind::DestReply;
            msg.pub_key = value_for_key(line, "PUB");
            msg.priv_key = value_for_key(line, "PRIV");
            // DEST REPLY has no RESULT on success; infer from the keys.
            msg.result = if result_str == "I2P_ERROR" {
                ResultCode::I2pError
            } else if !msg.pub_key.is_empty() && !msg.priv_key.is_empty() {
                ResultCode::Ok
            } else {
                ResultCode::Failed
            };
        }
        _ => {
            tracing::debug!("unrecognised SAM reply: {}", line);
        }
    }

    msg
}
