use std::{fmt, str::FromStr, time::Duration};

pub type SessionId = i64;

pub const QUIT_CODE: u8 = 1;
pub const QUERY_CODE: u8 = 3;
pub const PING_CODE: u8 = 14;

const FIELD_COUNT: usize = 4;
const NANOS_PER_SEC: i128 = 1_000_000_000;
const FRACTION_DIGITS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Quit,
    Ping,
    Query,
    Other(u8),
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            QUIT_CODE => Self::Quit,
            QUERY_CODE => Self::Query,
            PING_CODE => Self::Ping,
            other => Self::Other(other),
        }
    }
}

/// Capture timestamp, held as whole nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch {
    nanos: i128,
}

impl Epoch {
    pub const fn from_nanos(nanos: i128) -> Self {
        Self { nanos }
    }

    pub const fn as_nanos(self) -> i128 {
        self.nanos
    }

    /// Time from `earlier` to `self`, or zero when `earlier` is not earlier.
    pub fn saturating_duration_since(self, earlier: Epoch) -> Duration {
        let delta = self.nanos - earlier.nanos;
        if delta <= 0 {
            return Duration::ZERO;
        }
        let secs = u64::try_from(delta / NANOS_PER_SEC).unwrap_or(u64::MAX);
        let subsec = (delta % NANOS_PER_SEC) as u32;
        Duration::new(secs, subsec)
    }

    fn from_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.trunc();
        // Beyond this the `as` cast saturates and the scaling would overflow.
        if whole.abs() >= (i128::MAX / NANOS_PER_SEC) as f64 {
            return None;
        }
        let subsec = ((secs - whole) * 1e9).round() as i128;
        (whole as i128)
            .checked_mul(NANOS_PER_SEC)?
            .checked_add(subsec)
            .map(Self::from_nanos)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.nanos < 0 { "-" } else { "" };
        let magnitude = self.nanos.unsigned_abs();
        let nanos_per_sec = NANOS_PER_SEC as u128;
        write!(
            f,
            "{sign}{}.{:09}",
            magnitude / nanos_per_sec,
            magnitude % nanos_per_sec
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochParseError {
    raw: String,
}

impl fmt::Display for EpochParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid epoch `{}`", self.raw)
    }
}

impl std::error::Error for EpochParseError {}

impl FromStr for Epoch {
    type Err = EpochParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || EpochParseError { raw: s.to_owned() };
        let text = s.trim();
        if let Some(epoch) = parse_fixed_point(text) {
            return Ok(epoch);
        }
        // Exponent forms only; plain decimals never reach the float path.
        if !text.contains(['e', 'E']) {
            return Err(err());
        }
        text.parse::<f64>()
            .ok()
            .and_then(Epoch::from_secs_f64)
            .ok_or_else(err)
    }
}

fn parse_fixed_point(text: &str) -> Option<Epoch> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let secs: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().ok()?.into()
    };
    let mut subsec: i128 = 0;
    for position in 0..FRACTION_DIGITS {
        let digit = fraction.as_bytes().get(position).map_or(0, |b| b - b'0');
        subsec = subsec * 10 + i128::from(digit);
    }

    let nanos = secs * NANOS_PER_SEC + subsec;
    Some(Epoch::from_nanos(if negative { -nanos } else { nanos }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEvent {
    pub session: SessionId,
    pub epoch: Epoch,
    pub command: Command,
    pub statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    FieldCount(usize),
    Session(String),
    Epoch(EpochParseError),
    Command(String),
    Encoding,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldCount(found) => write!(
                f,
                "expected {FIELD_COUNT} tab-separated fields, found {found}"
            ),
            Self::Session(raw) => write!(f, "invalid session id `{raw}`"),
            Self::Epoch(err) => write!(f, "{err}"),
            Self::Command(raw) => write!(f, "invalid command code `{raw}`"),
            Self::Encoding => f.write_str("line is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decodes `session \t epoch \t command \t statement`. Every tab separates a
/// field, so a line is well formed only with exactly four of them.
pub fn parse_line(line: &str) -> Result<ReplayEvent, ParseError> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [session, epoch, command, statement] = fields[..] else {
        return Err(ParseError::FieldCount(fields.len()));
    };

    let session = session
        .trim()
        .parse::<SessionId>()
        .map_err(|_| ParseError::Session(session.to_owned()))?;
    let epoch = epoch.parse::<Epoch>().map_err(ParseError::Epoch)?;
    let command = command
        .trim()
        .parse::<u8>()
        .map_err(|_| ParseError::Command(command.to_owned()))?;

    Ok(ReplayEvent {
        session,
        epoch,
        command: Command::from(command),
        statement: statement.to_owned(),
    })
}
