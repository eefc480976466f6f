//! Zone files: the RFC 1035 master file subset the zone manager reads and
//! writes.
//!
//! Records are kept in file order. Writing re-emits every record in a
//! normalised one-record-per-line form, so a parsed and re-written zone is
//! stable across round trips.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// TTL of records the zone manager creates
pub const DEFAULT_RECORD_TTL: u32 = 300;
/// TTL of records without one and of glue records
pub const DEFAULT_ZONE_TTL: u32 = 3600;
/// TTL of nameserver and apex records in a fresh zone
pub const GLUE_TTL: u32 = 10800;

const CLASS_IN: &str = "IN";

/// Start of authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Soa {
    /// Primary nameserver
    pub mname: String,
    /// Hostmaster mailbox
    pub rname: String,
    /// Zone serial
    pub serial: u32,
    /// Secondary refresh interval
    pub refresh: u32,
    /// Secondary retry interval
    pub retry: u32,
    /// Secondary expiry
    pub expire: u32,
    /// Negative caching TTL
    pub minimum: u32,
}

/// Record data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    /// Start of authority
    Soa(Soa),
    /// IPv4 address
    A(Ipv4Addr),
    /// Delegation
    Ns(String),
    /// Text strings
    Txt(Vec<String>),
    /// Any other type, kept verbatim
    Other {
        /// Record type mnemonic
        rtype: String,
        /// Presentation format data
        data: String,
    },
}

impl RData {
    /// Type mnemonic
    pub fn rtype(&self) -> &str {
        match self {
            Self::Soa(_) => "SOA",
            Self::A(_) => "A",
            Self::Ns(_) => "NS",
            Self::Txt(_) => "TXT",
            Self::Other { rtype, .. } => rtype,
        }
    }
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soa(s) => write!(
                f,
                "{} {} {} {} {} {} {}",
                s.mname, s.rname, s.serial, s.refresh, s.retry, s.expire, s.minimum
            ),
            Self::A(ip) => write!(f, "{}", ip),
            Self::Ns(host) => f.write_str(host),
            Self::Txt(strings) => {
                let quoted: Vec<String> = strings.iter().map(|s| quote(s)).collect();
                f.write_str(&quoted.join(" "))
            }
            Self::Other { data, .. } => f.write_str(data),
        }
    }
}

/// One resource record with an absolute owner name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Absolute owner name, with trailing dot
    pub name: String,
    /// Time to live in seconds
    pub ttl: u32,
    /// Record data
    pub data: RData,
}

impl Record {
    /// Record of `data` for `name`
    pub fn new(name: impl Into<String>, ttl: u32, data: RData) -> Self {
        Self {
            name: name.into(),
            ttl,
            data,
        }
    }

    /// TXT record holding the single string `value`
    pub fn txt(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_RECORD_TTL, RData::Txt(vec![value.into()]))
    }

    /// A record
    pub fn a(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self::new(name, DEFAULT_RECORD_TTL, RData::A(ip))
    }

    /// Concatenated TXT strings, if this is a TXT record
    pub fn txt_value(&self) -> Option<String> {
        match &self.data {
            RData::Txt(strings) => Some(strings.concat()),
            _ => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            self.name,
            self.ttl,
            CLASS_IN,
            self.data.rtype(),
            self.data
        )
    }
}

/// Records of a zone in file order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Zone {
    /// Records
    pub records: Vec<Record>,
}

impl Zone {
    /// Parse a master file. Relative names are qualified with `origin`.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let mut parser = Parser {
            origin: fqdn(origin),
            default_ttl: DEFAULT_ZONE_TTL,
            last_owner: None,
        };
        let mut records = Vec::new();
        for (line_no, tokens, indented) in logical_lines(text)? {
            if let Some(record) = parser.line(line_no, tokens, indented)? {
                records.push(record);
            }
        }
        Ok(Self { records })
    }

    /// The SOA record
    pub fn soa(&self) -> Option<&Soa> {
        self.records.iter().find_map(|r| match &r.data {
            RData::Soa(soa) => Some(soa),
            _ => None,
        })
    }

    /// Mutable SOA record
    pub fn soa_mut(&mut self) -> Option<&mut Soa> {
        self.records.iter_mut().find_map(|r| match &mut r.data {
            RData::Soa(soa) => Some(soa),
            _ => None,
        })
    }

    /// Position of the first record equal in name and data to `record`
    pub fn position(&self, record: &Record) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.name == record.name && same_data(&r.data, &record.data))
    }

    /// Every TXT record of `name`
    pub fn txt_records<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .iter()
            .filter(move |r| r.name == name && matches!(r.data, RData::Txt(_)))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}

/// TXT records compare by concatenated value
fn same_data(a: &RData, b: &RData) -> bool {
    match (a, b) {
        (RData::Txt(x), RData::Txt(y)) => x.concat() == y.concat(),
        _ => a == b,
    }
}

/// `name` with a trailing dot
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Self::Word(s) | Self::Quoted(s) => s,
        }
    }
}

/// Split the file into logical lines, joining parenthesised continuations.
/// Yields the starting line number, the tokens and whether the line began
/// with whitespace.
fn logical_lines(text: &str) -> Result<Vec<(usize, Vec<Token>, bool)>> {
    let mut out = Vec::new();
    let mut current: Option<(usize, Vec<Token>, bool)> = None;
    let mut depth = 0usize;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let entry = current.get_or_insert_with(|| {
            let indented = line.starts_with([' ', '\t']);
            (line_no, Vec::new(), indented)
        });
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ';' => break,
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| Error::parse(line_no, "unbalanced ')'"))?;
                }
                '"' => {
                    let mut s = String::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(next) = chars.next() {
                                    s.push(next);
                                }
                            }
                            '"' => {
                                closed = true;
                                break;
                            }
                            _ => s.push(c),
                        }
                    }
                    if !closed {
                        return Err(Error::parse(line_no, "unterminated string"));
                    }
                    entry.1.push(Token::Quoted(s));
                }
                c if c.is_whitespace() => {}
                c => {
                    let mut word = String::from(c);
                    while let Some(&next) = chars.peek() {
                        if next.is_whitespace() || "();\"".contains(next) {
                            break;
                        }
                        word.push(next);
                        chars.next();
                    }
                    entry.1.push(Token::Word(word));
                }
            }
        }
        if depth == 0 {
            if let Some(entry) = current.take() {
                if !entry.1.is_empty() {
                    out.push(entry);
                }
            }
        }
    }
    if depth > 0 {
        let line = current.map_or(0, |c| c.0);
        return Err(Error::parse(line, "unbalanced '('"));
    }
    Ok(out)
}

struct Parser {
    origin: String,
    default_ttl: u32,
    last_owner: Option<String>,
}

impl Parser {
    fn absolute(&self, name: &str) -> String {
        if name == "@" {
            self.origin.clone()
        } else if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.{}", name, self.origin)
        }
    }

    fn line(
        &mut self,
        line_no: usize,
        tokens: Vec<Token>,
        indented: bool,
    ) -> Result<Option<Record>> {
        let mut tokens = tokens.into_iter().peekable();
        let first = match tokens.peek() {
            Some(Token::Word(w)) => w.clone(),
            _ => return Err(Error::parse(line_no, "expected an owner name or directive")),
        };
        match first.as_str() {
            "$ORIGIN" => {
                tokens.next();
                let origin = tokens
                    .next()
                    .ok_or_else(|| Error::parse(line_no, "$ORIGIN needs a name"))?;
                self.origin = self.absolute(origin.text());
                return Ok(None);
            }
            "$TTL" => {
                tokens.next();
                let ttl = tokens
                    .next()
                    .ok_or_else(|| Error::parse(line_no, "$TTL needs a value"))?;
                self.default_ttl = parse_u32(line_no, ttl.text())?;
                return Ok(None);
            }
            d if d.starts_with('$') => {
                return Err(Error::parse(line_no, format!("unsupported directive {}", d)));
            }
            _ => {}
        }

        let owner = if indented {
            self.last_owner
                .clone()
                .ok_or_else(|| Error::parse(line_no, "record without owner name"))?
        } else {
            let name = tokens.next().map(|t| t.text().to_string()).unwrap_or_default();
            self.absolute(&name)
        };
        self.last_owner = Some(owner.clone());

        let mut ttl = None;
        let rtype = loop {
            let token = tokens
                .next()
                .ok_or_else(|| Error::parse(line_no, "missing record type"))?;
            let word = token.text().to_string();
            if word.eq_ignore_ascii_case(CLASS_IN) {
                continue;
            }
            if ttl.is_none() && word.chars().all(|c| c.is_ascii_digit()) {
                ttl = Some(parse_u32(line_no, &word)?);
                continue;
            }
            break word.to_ascii_uppercase();
        };
        let rest: Vec<Token> = tokens.collect();
        let data = self.rdata(line_no, &rtype, rest)?;
        Ok(Some(Record::new(owner, ttl.unwrap_or(self.default_ttl), data)))
    }

    fn rdata(&self, line_no: usize, rtype: &str, rest: Vec<Token>) -> Result<RData> {
        let words: Vec<&str> = rest.iter().map(Token::text).collect();
        match rtype {
            "SOA" => {
                if words.len() != 7 {
                    return Err(Error::parse(line_no, "SOA needs 7 fields"));
                }
                Ok(RData::Soa(Soa {
                    mname: self.absolute(words[0]),
                    rname: self.absolute(words[1]),
                    serial: parse_u32(line_no, words[2])?,
                    refresh: parse_u32(line_no, words[3])?,
                    retry: parse_u32(line_no, words[4])?,
                    expire: parse_u32(line_no, words[5])?,
                    minimum: parse_u32(line_no, words[6])?,
                }))
            }
            "A" => {
                let ip = words
                    .first()
                    .ok_or_else(|| Error::parse(line_no, "A needs an address"))?;
                ip.parse()
                    .map(RData::A)
                    .map_err(|_| Error::parse(line_no, format!("invalid IPv4 address {}", ip)))
            }
            "NS" => words
                .first()
                .map(|host| RData::Ns(self.absolute(host)))
                .ok_or_else(|| Error::parse(line_no, "NS needs a host")),
            "TXT" => {
                if rest.is_empty() {
                    return Err(Error::parse(line_no, "TXT needs a value"));
                }
                Ok(RData::Txt(rest.into_iter().map(|t| match t {
                    Token::Word(s) | Token::Quoted(s) => s,
                }).collect()))
            }
            other => Ok(RData::Other {
                rtype: other.to_string(),
                data: rest
                    .iter()
                    .map(|t| match t {
                        Token::Word(s) => s.clone(),
                        Token::Quoted(s) => quote(s),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            }),
        }
    }
}

fn parse_u32(line_no: usize, s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::parse(line_no, format!("invalid number {}", s)))
}

/// Records of a zone nobody has written yet
pub fn initial_zone(
    zone: &str,
    serial: u32,
    nameservers: &[Ipv4Addr],
    public_ips: &[Ipv4Addr],
    private_ip: Option<Ipv4Addr>,
) -> Zone {
    let origin = fqdn(zone);
    let mut records = vec![Record::new(
        origin.clone(),
        DEFAULT_ZONE_TTL,
        RData::Soa(Soa {
            mname: format!("ns1.{}", origin),
            rname: format!("hostmaster.{}", origin),
            serial,
            refresh: 7200,
            retry: 3600,
            expire: 1_209_600,
            minimum: 3600,
        }),
    )];
    for (i, ip) in nameservers.iter().enumerate() {
        records.push(Record::new(format!("ns{}.{}", i + 1, origin), GLUE_TTL, RData::A(*ip)));
    }
    for ip in public_ips {
        for name in [origin.clone(), format!("*.{}", origin), format!("*.*.{}", origin)] {
            records.push(Record::new(name, GLUE_TTL, RData::A(*ip)));
        }
    }
    if let Some(ip) = private_ip {
        records.push(Record::new(format!("*.p.{}", origin), GLUE_TTL, RData::A(ip)));
    }
    Zone { records }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = r#"
$TTL 3600
lekva.me.   IN SOA ns1.lekva.me. hostmaster.lekva.me. (
        2024010100 ; serial
        7200 3600 1209600 3600 )
ns1.lekva.me. 10800 IN A 10.0.0.1
        IN TXT "v=spf1 -all"
_acme-challenge IN 300 TXT "abc" "def"
@ NS ns1
"#;

    #[test]
    fn parses_multiline_soa_and_relative_names() {
        let zone = Zone::parse(ZONE, "lekva.me").expect("parse");
        assert_eq!(zone.records.len(), 5);
        let soa = zone.soa().expect("soa");
        assert_eq!(soa.serial, 2024010100);
        assert_eq!(soa.minimum, 3600);
        assert_eq!(zone.records[2].name, "ns1.lekva.me.");
        assert_eq!(zone.records[2].ttl, 3600);
        assert_eq!(zone.records[3].name, "_acme-challenge.lekva.me.");
        assert_eq!(zone.records[3].txt_value().as_deref(), Some("abcdef"));
        assert_eq!(zone.records[4].data, RData::Ns("ns1.lekva.me.".to_string()));
    }

    #[test]
    fn emitted_zone_parses_back_identically() {
        let zone = Zone::parse(ZONE, "lekva.me").expect("parse");
        let text = zone.to_string();
        assert!(text.contains("ns1.lekva.me.\t10800\tIN\tA\t10.0.0.1\n"));
        assert_eq!(Zone::parse(&text, "lekva.me").expect("reparse"), zone);
    }

    #[test]
    fn quotes_and_backslashes_survive() {
        let mut zone = Zone::default();
        zone.records.push(Record::txt("x.lekva.me.", r#"a "quoted" \ value"#));
        let back = Zone::parse(&zone.to_string(), "lekva.me").expect("parse");
        assert_eq!(back.records[0].txt_value().as_deref(), Some(r#"a "quoted" \ value"#));
    }

    #[test]
    fn malformed_lines_report_their_number() {
        let err = Zone::parse("lekva.me. IN A 300.1.1.1\n", "lekva.me").expect_err("bad ip");
        assert!(matches!(err, Error::Parse { line: 1, .. }));
        let err = Zone::parse("a IN TXT \"open\n", "lekva.me").expect_err("unterminated");
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn initial_zone_has_glue_and_wildcards() {
        let zone = initial_zone(
            "lekva.me",
            10,
            &["10.0.0.1".parse().expect("ip"), "10.0.0.2".parse().expect("ip")],
            &["135.181.48.180".parse().expect("ip")],
            Some("10.1.0.1".parse().expect("ip")),
        );
        let names: Vec<_> = zone.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "lekva.me.",
                "ns1.lekva.me.",
                "ns2.lekva.me.",
                "lekva.me.",
                "*.lekva.me.",
                "*.*.lekva.me.",
                "*.p.lekva.me.",
            ]
        );
        assert_eq!(zone.soa().expect("soa").mname, "ns1.lekva.me.");
    }
}
