//! Request framing.
//!
//! Requests travel as RESP arrays of bulk strings:
//!
//! ```text
//! GET name  ->  *2\r\n$3\r\nGET\r\n$4\r\nname\r\n
//! ```
//!
//! Higher-level command builders hand the multiplexer a [`Command`]; the
//! multiplexer only looks at the name (for diagnostics and purpose), the
//! routing key, the read preference and the target database.

use crate::connection::ConnectionPurpose;
use crate::protocol::types::{prefix, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Where a command may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// The primary; a replica only if no primary is routable.
    #[default]
    PreferPrimary,
    /// Primary only, even if the routing oracle allows replica reads.
    DemandPrimary,
    /// A healthy replica when replica reads are allowed, else the primary.
    PreferReplica,
    /// A healthy replica, or fail.
    DemandReplica,
}

impl ReadPreference {
    pub fn wants_replica(&self) -> bool {
        matches!(self, ReadPreference::PreferReplica | ReadPreference::DemandReplica)
    }
}

const SUBSCRIBE_FAMILY: [&str; 3] = ["SUBSCRIBE", "PSUBSCRIBE", "SSUBSCRIBE"];
const UNSUBSCRIBE_FAMILY: [&str; 3] = ["UNSUBSCRIBE", "PUNSUBSCRIBE", "SUNSUBSCRIBE"];

/// Commands a replica can serve. Anything not listed is treated as a write.
const READ_ONLY: &[&str] = &[
    "BITCOUNT", "BITPOS", "DBSIZE", "DUMP", "ECHO", "EXISTS", "GEODIST", "GEOHASH", "GEOPOS",
    "GEOSEARCH", "GET", "GETBIT", "GETRANGE", "HEXISTS", "HGET", "HGETALL", "HKEYS", "HLEN",
    "HMGET", "HRANDFIELD", "HSCAN", "HSTRLEN", "HVALS", "KEYS", "LINDEX", "LLEN", "LPOS",
    "LRANGE", "MGET", "PFCOUNT", "PING", "PTTL", "RANDOMKEY", "SCAN", "SCARD", "SDIFF",
    "SINTER", "SISMEMBER", "SMEMBERS", "SMISMEMBER", "SRANDMEMBER", "SSCAN", "STRLEN",
    "SUNION", "TIME", "TTL", "TYPE", "XLEN", "XRANGE", "XREVRANGE", "ZCARD", "ZCOUNT",
    "ZMSCORE", "ZRANGE", "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREVRANGE",
    "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE",
];

/// Longest argument rendered by `summary()`.
const SUMMARY_ARG_LIMIT: usize = 64;

/// A single request: the command name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
    key_index: Option<usize>,
    read_preference: ReadPreference,
    database: Option<u32>,
}

impl Command {
    /// Starts a command. The name is normalised to upper case.
    ///
    /// ```
    /// use flashmux::protocol::Command;
    /// let cmd = Command::new("get").key("user:1");
    /// assert_eq!(cmd.name(), "GET");
    /// assert_eq!(cmd.routing_key(), Some(&b"user:1"[..]));
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            args: Vec::new(),
            key_index: None,
            read_preference: ReadPreference::default(),
            database: None,
        }
    }

    /// Builds a command from whitespace-split words, first word is the name.
    pub fn from_words<I, S>(words: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Bytes>,
    {
        let mut iter = words.into_iter().map(Into::into);
        let name = iter.next()?;
        let name = String::from_utf8_lossy(&name).into_owned();
        let mut cmd = Command::new(name);
        for arg in iter {
            cmd = cmd.arg(arg);
        }
        if cmd.args.first().is_some() && cmd.purpose() == ConnectionPurpose::Interactive {
            cmd.key_index = Some(0);
        }
        Some(cmd)
    }

    /// Appends a plain argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends the argument the routing oracle should hash on.
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key_index = Some(self.args.len());
        self.args.push(key.into());
        self
    }

    pub fn with_read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    /// Targets a logical database; the connection issues `SELECT` as needed.
    pub fn with_database(mut self, db: u32) -> Self {
        self.database = Some(db);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        self.key_index
            .and_then(|i| self.args.get(i))
            .map(|k| k.as_ref())
    }

    pub fn read_preference(&self) -> ReadPreference {
        self.read_preference
    }

    pub fn database(&self) -> Option<u32> {
        self.database
    }

    /// Which kind of connection must carry this command.
    pub fn purpose(&self) -> ConnectionPurpose {
        let name = self.name.as_str();
        if SUBSCRIBE_FAMILY.contains(&name) || UNSUBSCRIBE_FAMILY.contains(&name) {
            ConnectionPurpose::Subscription
        } else {
            ConnectionPurpose::Interactive
        }
    }

    /// Whether the command only reads, so a replica may serve it.
    pub fn is_read_only(&self) -> bool {
        READ_ONLY.contains(&self.name.as_str())
    }

    /// Number of replies the server sends for this command.
    ///
    /// Subscribe-family commands are confirmed once per channel. An
    /// argument-less unsubscribe is counted as one reply; any further
    /// confirmations surface as pushes.
    pub fn expected_replies(&self) -> usize {
        let name = self.name.as_str();
        if SUBSCRIBE_FAMILY.contains(&name) || UNSUBSCRIBE_FAMILY.contains(&name) {
            self.args.len().max(1)
        } else {
            1
        }
    }

    /// Encoded length in bytes, used to size write batches.
    pub fn encoded_len(&self) -> usize {
        let mut len = header_len(self.args.len() + 1);
        len += header_len(self.name.len()) + self.name.len() + 2;
        for arg in &self.args {
            len += header_len(arg.len()) + arg.len() + 2;
        }
        len
    }

    /// Appends the RESP encoding of this command to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        write_header(buf, prefix::ARRAY, self.args.len() + 1);
        write_bulk(buf, self.name.as_bytes());
        for arg in &self.args {
            write_bulk(buf, arg);
        }
    }

    /// Returns the RESP encoding of this command.
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// A short, printable description such as `GET user:1`.
    pub fn summary(&self) -> String {
        match self.routing_key().or_else(|| self.args.first().map(|a| a.as_ref())) {
            Some(first) => {
                let shown = &first[..first.len().min(SUMMARY_ARG_LIMIT)];
                format!("{} {}", self.name, String::from_utf8_lossy(shown))
            }
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

fn header_len(n: usize) -> usize {
    // prefix + digits + CRLF
    1 + n.to_string().len() + 2
}

fn write_header(buf: &mut BytesMut, kind: u8, n: usize) {
    buf.put_u8(kind);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn write_bulk(buf: &mut BytesMut, data: &[u8]) {
    write_header(buf, prefix::BULK_STRING, data.len());
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_array_of_bulk_strings() {
        let cmd = Command::new("SET").key("name").arg("Ariz");
        assert_eq!(
            &cmd.to_frame()[..],
            b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n"
        );
        assert_eq!(cmd.encoded_len(), cmd.to_frame().len());
    }

    #[test]
    fn test_encodes_binary_arguments() {
        let cmd = Command::new("SET").key(&b"k\r\n"[..]).arg(&b"\x00\xff"[..]);
        let frame = cmd.to_frame();
        assert_eq!(&frame[..], b"*3\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n$2\r\n\x00\xff\r\n");
    }

    #[test]
    fn test_name_is_upper_cased() {
        assert_eq!(Command::new("ping").name(), "PING");
        assert_eq!(&Command::new("ping").to_frame()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_from_words_uses_first_argument_as_key() {
        let cmd = Command::from_words(["sadd", "myset", "a"]).unwrap();
        assert_eq!(cmd.name(), "SADD");
        assert_eq!(cmd.routing_key(), Some(&b"myset"[..]));
        assert_eq!(cmd.summary(), "SADD myset");
        assert!(Command::from_words(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_subscription_purpose_and_reply_count() {
        let sub = Command::new("subscribe").arg("a").arg("b");
        assert_eq!(sub.purpose(), ConnectionPurpose::Subscription);
        assert_eq!(sub.expected_replies(), 2);

        let unsub = Command::new("UNSUBSCRIBE");
        assert_eq!(unsub.expected_replies(), 1);

        let get = Command::new("GET").key("a");
        assert_eq!(get.purpose(), ConnectionPurpose::Interactive);
        assert_eq!(get.expected_replies(), 1);
    }

    #[test]
    fn test_summary_truncates_long_keys() {
        let key = "k".repeat(500);
        let summary = Command::new("GET").key(key).summary();
        assert_eq!(summary.len(), "GET ".len() + SUMMARY_ARG_LIMIT);
    }

    #[test]
    fn test_read_only_classification() {
        assert!(Command::new("get").key("k").is_read_only());
        assert!(Command::new("SMEMBERS").key("s").is_read_only());
        assert!(!Command::new("SET").key("k").arg("v").is_read_only());
        assert!(!Command::new("FLUSHALL").is_read_only());
        // Unknown commands are assumed to write.
        assert!(!Command::new("MODULE.CMD").is_read_only());
    }
}
