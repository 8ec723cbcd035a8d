use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// One request issued by a workload against the memory subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Alloc { size: usize, region: usize },
    Free { region: usize },
    Read { region: usize, offset: usize },
    Write { value: u8, region: usize, offset: usize },
    Calc,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Alloc { size, region } => write!(f, "alloc {} {}", size, region),
            Instruction::Free { region } => write!(f, "free {}", region),
            Instruction::Read { region, offset } => write!(f, "read {} {}", region, offset),
            Instruction::Write {
                value,
                region,
                offset,
            } => write!(f, "write {} {} {}", value, region, offset),
            Instruction::Calc => f.write_str("calc"),
        }
    }
}

/// Parsed workload of one process
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Workload {
    pub code: Vec<Instruction>,
}

impl Workload {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut code = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            code.push(parse_instruction(idx + 1, line)?);
        }
        Ok(Workload { code })
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

fn parse_instruction(line: usize, text: &str) -> Result<Instruction> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let err = |msg: String| Error::Parse { line, msg };
    let arity = |n: usize| {
        if tokens.len() == n + 1 {
            Ok(())
        } else {
            Err(err(format!(
                "{} expects {} arguments, got {}",
                tokens[0],
                n,
                tokens.len() - 1
            )))
        }
    };
    let num = |idx: usize| -> Result<usize> {
        parse_number(tokens[idx]).ok_or_else(|| err(format!("invalid number: {}", tokens[idx])))
    };

    match tokens[0] {
        "alloc" => {
            arity(2)?;
            Ok(Instruction::Alloc {
                size: num(1)?,
                region: num(2)?,
            })
        }
        "free" => {
            arity(1)?;
            Ok(Instruction::Free { region: num(1)? })
        }
        "read" => {
            arity(2)?;
            Ok(Instruction::Read {
                region: num(1)?,
                offset: num(2)?,
            })
        }
        "write" => {
            arity(3)?;
            let value = num(1)?;
            let value = u8::try_from(value).map_err(|_| err(format!("value {} does not fit a byte", value)))?;
            Ok(Instruction::Write {
                value,
                region: num(2)?,
                offset: num(3)?,
            })
        }
        "calc" => {
            arity(0)?;
            Ok(Instruction::Calc)
        }
        other => Err(err(format!("unknown instruction: {}", other))),
    }
}

/// Decimal, or hex with a `0x` prefix
fn parse_number(token: &str) -> Option<usize> {
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_instructions() {
        let content = "\
# sample
alloc 300 0
write 0xAB 0 0
read 0 299   # last byte
calc

free 0
";
        let workload = Workload::parse(content).unwrap();
        assert_eq!(
            workload.code,
            vec![
                Instruction::Alloc { size: 300, region: 0 },
                Instruction::Write { value: 0xAB, region: 0, offset: 0 },
                Instruction::Read { region: 0, offset: 299 },
                Instruction::Calc,
                Instruction::Free { region: 0 },
            ]
        );
    }

    #[test]
    fn test_parse_errors_carry_line_number() {
        let err = Workload::parse("calc\nalloc 10\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 2, .. }));

        let err = Workload::parse("jump 4").unwrap_err();
        assert!(err.to_string().contains("unknown instruction"));

        assert!(Workload::parse("write 256 0 0").is_err());
        assert!(Workload::parse("read x 0").is_err());
    }

    #[test]
    fn test_empty_workload() {
        let workload = Workload::parse("# nothing\n\n").unwrap();
        assert!(workload.is_empty());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let inst = Instruction::Write { value: 7, region: 2, offset: 9 };
        let parsed = Workload::parse(&inst.to_string()).unwrap();
        assert_eq!(parsed.code, vec![inst]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0.txt");
        fs::write(&path, "alloc 16 1\nwrite 3 1 15\n").unwrap();
        let workload = Workload::from_file(&path).unwrap();
        assert_eq!(workload.len(), 2);

        assert!(matches!(
            Workload::from_file(dir.path().join("missing.txt")),
            Err(Error::Io(_))
        ));
    }
}
