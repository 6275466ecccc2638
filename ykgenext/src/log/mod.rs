//! Logging controlled by the `YKD_LOG*` environment variables.
//!
//! `YKD_LOG_IR` only does anything when the `ykd` feature is enabled: without it, [should_log_ir]
//! always returns `false`.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf, str::FromStr};
use strum::{EnumCount, EnumString, FromRepr};

pub(crate) mod stats;

/// How verbose should logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    Disabled,
    Error,
    /// e.g. an instruction that had to fall back to generic code.
    Warning,
    /// e.g. a generating extension has been built.
    JITEvent,
}

impl Verbosity {
    fn prefix(self) -> &'static str {
        match self {
            Verbosity::Disabled => "",
            Verbosity::Error => "yk-error",
            Verbosity::Warning => "yk-warning",
            Verbosity::JITEvent => "yk-jit-event",
        }
    }
}

/// Where log output goes.
#[derive(Debug, PartialEq)]
enum Sink {
    Stderr,
    /// Appended to. The file is truncated when the sink is parsed.
    File(PathBuf),
}

impl Sink {
    /// Parse `-` (stderr) or a path, truncating any existing file at that path.
    fn parse(s: &str) -> Self {
        if s == "-" {
            Sink::Stderr
        } else {
            let p = PathBuf::from(s);
            File::create(&p).ok();
            Sink::File(p)
        }
    }

    fn write(&self, s: &str) {
        match self {
            Sink::Stderr => eprint!("{s}"),
            Sink::File(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .and_then(|mut f| f.write_all(s.as_bytes()))
                    .ok();
            }
        }
    }
}

pub(crate) struct Log {
    level: Verbosity,
    sink: Sink,
}

impl Log {
    /// Configure logging from `YKD_LOG`. Without it, errors are logged to stderr.
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("YKD_LOG") {
            Ok(s) => s.parse(),
            Err(_) => Ok(Self {
                level: Verbosity::Error,
                sink: Sink::Stderr,
            }),
        }
    }

    /// Log `msg` if `level` is enabled.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        assert_ne!(level, Verbosity::Disabled);
        if level <= self.level {
            self.sink.write(&format!("{}: {msg}\n", level.prefix()));
        }
    }
}

impl FromStr for Log {
    type Err = Box<dyn Error>;

    /// Parse a `YKD_LOG` value of the form `[<path|->:]<level>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sink, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => (Sink::parse(path), level),
            [level] => (Sink::Stderr, level),
            _ => return Err("YKD_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let n = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid YKD_LOG level '{s}': {e}"))?;
        let level = Verbosity::from_repr(n).ok_or_else(|| {
            format!(
                "YKD_LOG level {n} exceeds maximum {}",
                Verbosity::COUNT - 1
            )
        })?;
        Ok(Self { level, sink })
    }
}

/// The points during building at which IR can be dumped.
#[derive(Debug, EnumString, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The instruction stream a generating extension is built from.
    #[strum(serialize = "genext-insns")]
    Insns,
    /// The generated code.
    #[strum(serialize = "genext-code")]
    Code,
}

/// Parse a `YKD_LOG_IR` value of the form `[<path|->:]<phase>[,...,<phase>]`.
#[cfg_attr(not(feature = "ykd"), allow(dead_code))]
fn parse_log_ir(s: &str) -> Result<(Sink, Vec<IRPhase>), Box<dyn Error>> {
    let (path, phases) = match s.split(':').collect::<Vec<_>>()[..] {
        [path, phases] => (path, phases),
        [phases] => ("-", phases),
        _ => return Err("YKD_LOG_IR must be of the format `[<path|->:]<phase>[,...]`".into()),
    };
    let phases = phases
        .split(',')
        .map(|x| IRPhase::from_str(x).map_err(|_| format!("Invalid YKD_LOG_IR phase: {x}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Sink::parse(path), phases))
}

#[cfg(not(feature = "ykd"))]
mod internals {
    use super::IRPhase;

    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }

    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "ykd")]
mod internals {
    use super::{parse_log_ir, IRPhase, Sink};
    use std::{collections::HashSet, env, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(Sink, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let s = env::var("YKD_LOG_IR").ok()?;
        match parse_log_ir(&s) {
            Ok((sink, phases)) => Some((sink, phases.into_iter().collect())),
            Err(e) => panic!("{e}"),
        }
    });

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        if let Some((sink, _)) = LOG_IR.as_ref() {
            sink.write(s);
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_levels() {
        let l = Log::from_str("2").unwrap();
        assert_eq!(l.level, Verbosity::Warning);
        assert_eq!(l.sink, Sink::Stderr);
        let l = Log::from_str("-:3").unwrap();
        assert_eq!(l.level, Verbosity::JITEvent);
        assert_eq!(l.sink, Sink::Stderr);
        assert!(Log::from_str("4").is_err());
        assert!(Log::from_str("x").is_err());
        assert!(Log::from_str("a:b:1").is_err());
    }

    #[test]
    fn parse_ir_phases() {
        let (sink, phases) = parse_log_ir("genext-code,genext-insns").unwrap();
        assert_eq!(sink, Sink::Stderr);
        assert_eq!(phases, [IRPhase::Code, IRPhase::Insns]);
        let (_, phases) = parse_log_ir("-:genext-code").unwrap();
        assert_eq!(phases, [IRPhase::Code]);
        assert!(parse_log_ir("aot").is_err());
        assert!(parse_log_ir("a:b:genext-code").is_err());
    }
}
