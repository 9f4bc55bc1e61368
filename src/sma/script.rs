use crate::prelude::*;

use std::fmt;

use super::retry::Checkpoint;
use crate::error::ScriptError;

const END: &str = "$END";

/// Named values substituted into, or extracted from, a directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    Addr,
    Time,
    Ser,
    Crc,
    Pow,
    Dtot,
    Add2,
    Chan,
    ITime,
    TimeMinus,
    TimePlus,
    TimeString,
    TimeFrom1,
    TimeTo1,
    TimeFrom2,
    TimeTo2,
    TestData,
    ArchiveData1,
    Password,
    Signal,
    Unknown,
    InvCode,
    ArchCode,
    InverterData,
    Cnt,
    Timezone,
    TimeSet,
}

const PLACEHOLDERS: [(&str, Placeholder); 27] = [
    ("$ADDR", Placeholder::Addr),
    ("$TIME", Placeholder::Time),
    ("$SER", Placeholder::Ser),
    ("$CRC", Placeholder::Crc),
    ("$POW", Placeholder::Pow),
    ("$DTOT", Placeholder::Dtot),
    ("$ADD2", Placeholder::Add2),
    ("$CHAN", Placeholder::Chan),
    ("$ITIME", Placeholder::ITime),
    ("$TMMI", Placeholder::TimeMinus),
    ("$TMPL", Placeholder::TimePlus),
    ("$TIMESTRING", Placeholder::TimeString),
    ("$TIMEFROM1", Placeholder::TimeFrom1),
    ("$TIMETO1", Placeholder::TimeTo1),
    ("$TIMEFROM2", Placeholder::TimeFrom2),
    ("$TIMETO2", Placeholder::TimeTo2),
    ("$TESTDATA", Placeholder::TestData),
    ("$ARCHIVEDATA1", Placeholder::ArchiveData1),
    ("$PASSWORD", Placeholder::Password),
    ("$SIGNAL", Placeholder::Signal),
    ("$UNKNOWN", Placeholder::Unknown),
    ("$INVCODE", Placeholder::InvCode),
    ("$ARCHCODE", Placeholder::ArchCode),
    ("$INVERTERDATA", Placeholder::InverterData),
    ("$CNT", Placeholder::Cnt),
    ("$TIMEZONE", Placeholder::Timezone),
    ("$TIMESET", Placeholder::TimeSet),
];

impl Placeholder {
    pub fn name(self) -> &'static str {
        PLACEHOLDERS
            .iter()
            .find(|(_, p)| *p == self)
            .map(|(name, _)| *name)
            .unwrap_or("$?")
    }

    fn allowed_in(self, kind: char) -> bool {
        use Placeholder::*;

        match kind {
            'R' => matches!(self, Addr | Ser | Add2 | Chan),
            'S' => !matches!(
                self,
                Pow | Dtot | ITime | TestData | ArchiveData1 | Signal | InverterData
            ),
            'E' => matches!(
                self,
                Ser | ITime
                    | Pow
                    | Dtot
                    | Add2
                    | Chan
                    | TimeString
                    | TestData
                    | ArchiveData1
                    | Signal
                    | InvCode
                    | InverterData
            ),
            _ => false,
        }
    }
}

impl FromStr for Placeholder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PLACEHOLDERS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, p)| *p)
            .ok_or_else(|| format!("unknown placeholder {}", s))
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    Placeholder(Placeholder),
    Byte(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Init,
    Setup,
    StartSetup,
    SetInverter1,
    GetRangeData,
}

impl Marker {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            ":init" => Some(Marker::Init),
            ":setup" => Some(Marker::Setup),
            ":startsetup" => Some(Marker::StartSetup),
            ":setinverter1" => Some(Marker::SetInverter1),
            ":getrangedata" => Some(Marker::GetRangeData),
            _ => None,
        }
    }

    /// Markers a failed run rewinds to.
    pub fn is_checkpoint(self) -> bool {
        !matches!(self, Marker::StartSetup)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Receive(Vec<Token>),
    Send(Vec<Token>),
    Extract(Vec<Placeholder>),
    Marker(Marker),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number in the script file.
    pub number: usize,
    /// Byte offset of the line in the script file.
    pub offset: usize,
    pub directive: Directive,
}

/// A command script: the directive lines of the file in order. Comment
/// lines, blank lines and the unit conversion section carry no directive
/// and are skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    lines: Vec<Line>,
    len: usize,
}

impl Script {
    pub fn load(path: &str) -> Result<(Self, String)> {
        let text = std::fs::read_to_string(path).with_context(|| format!("could not read script {}", path))?;
        let script = Self::parse(&text).with_context(|| format!("in script {}", path))?;
        info!("loaded {} directives from {}", script.lines.len(), path);
        Ok((script, text))
    }

    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut lines = Vec::new();
        let mut offset = 0;

        for (i, raw) in text.split_inclusive('\n').enumerate() {
            let number = i + 1;
            if let Some(directive) = parse_line(raw, number)? {
                lines.push(Line {
                    number,
                    offset,
                    directive,
                });
            }
            offset += raw.len();
        }

        Ok(Self {
            lines,
            len: text.len(),
        })
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Where to resume after a failure once the marker at `index` has run.
    pub fn checkpoint_after(&self, index: usize) -> Checkpoint {
        Checkpoint {
            index: index + 1,
            offset: self.lines.get(index + 1).map(|l| l.offset).unwrap_or(self.len),
            line: self.lines.get(index).map(|l| l.number).unwrap_or_default(),
        }
    }
}

fn split_words(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty())
}

fn parse_line(line: &str, number: usize) -> Result<Option<Directive>, ScriptError> {
    let mut words = split_words(line);
    let Some(first) = words.next() else {
        return Ok(None);
    };

    let kind = match first {
        "R" | "S" | "E" => first.chars().next().unwrap_or_default(),
        _ => return Ok(Marker::from_word(first).map(Directive::Marker)),
    };

    let mut tokens = Vec::new();
    let mut ended = false;
    for word in words {
        if word == END {
            ended = true;
            break;
        }
        tokens.push(token(word, kind, number)?);
    }
    if !ended {
        return Err(ScriptError::MissingEnd { line: number });
    }

    let directive = match kind {
        'R' => Directive::Receive(tokens),
        'S' => Directive::Send(tokens),
        _ => Directive::Extract(
            tokens
                .into_iter()
                .map(|t| match t {
                    Token::Placeholder(p) => Ok(p),
                    Token::Byte(b) => Err(ScriptError::InvalidToken {
                        line: number,
                        token: format!("{:02x}", b),
                        directive: kind,
                    }),
                })
                .collect::<Result<_, _>>()?,
        ),
    };

    Ok(Some(directive))
}

fn token(word: &str, kind: char, line: usize) -> Result<Token, ScriptError> {
    if word.starts_with('$') {
        let placeholder = word.parse::<Placeholder>().map_err(|_| ScriptError::BadLiteral {
            line,
            token: word.to_string(),
        })?;
        if !placeholder.allowed_in(kind) {
            return Err(ScriptError::InvalidToken {
                line,
                token: word.to_string(),
                directive: kind,
            });
        }
        return Ok(Token::Placeholder(placeholder));
    }

    if word.len() != 2 {
        return Err(ScriptError::BadLiteral {
            line,
            token: word.to_string(),
        });
    }
    u8::from_str_radix(word, 16)
        .map(Token::Byte)
        .map_err(|_| ScriptError::BadLiteral {
            line,
            token: word.to_string(),
        })
}
