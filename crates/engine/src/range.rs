//! Page and item range specs such as `1-5,8,10-`.
//!
//! Grammar: comma-separated terms, each `N`, `A-B`, or `A-`. Numbers are 1-based
//! and no whitespace is allowed. Resolution sorts by start position and keeps
//! duplicates; an open range stays unexpanded until the total is known.

use std::fmt;

use crate::errors::ValidationError;

/// Upper bound on the number of positions a closed term may expand to.
pub const MAX_EXPANDED_ITEMS: u64 = 100_000;

/// One comma-separated term of a range spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeTerm {
    Single(u32),
    Closed { start: u32, end: u32 },
    OpenEnded { start: u32 },
}

impl RangeTerm {
    fn start(&self) -> u32 {
        match self {
            RangeTerm::Single(position) => *position,
            RangeTerm::Closed { start, .. } | RangeTerm::OpenEnded { start } => *start,
        }
    }
}

impl fmt::Display for RangeTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeTerm::Single(position) => write!(f, "{position}"),
            RangeTerm::Closed { start, end } => write!(f, "{start}-{end}"),
            RangeTerm::OpenEnded { start } => write!(f, "{start}-"),
        }
    }
}

/// A resolved position or an open tail awaiting the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Item(u32),
    From(u32),
}

impl RangeUnit {
    fn start(&self) -> u32 {
        match self {
            RangeUnit::Item(position) | RangeUnit::From(position) => *position,
        }
    }
}

/// A selected source position and its 1-based output ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub source: u32,
    pub ordinal: usize,
}

/// Parsed range spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    raw: String,
    terms: Vec<RangeTerm>,
}

impl RangeSpec {
    /// Parses `raw`, rejecting whitespace, zero, empty terms, and reversed bounds.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::range(raw, "range is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ValidationError::range(raw, "whitespace is not allowed"));
        }

        let mut terms = Vec::new();
        for term in raw.split(',') {
            terms.push(parse_term(raw, term)?);
        }
        Ok(Self {
            raw: raw.to_string(),
            terms,
        })
    }

    /// Selects every position: `1-`.
    pub fn all() -> Self {
        Self {
            raw: "1-".to_string(),
            terms: vec![RangeTerm::OpenEnded { start: 1 }],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn terms(&self) -> &[RangeTerm] {
        &self.terms
    }

    pub fn has_open_end(&self) -> bool {
        self.terms.iter().any(|term| matches!(term, RangeTerm::OpenEnded { .. }))
    }

    /// Resolves to ordered units. Without a total, open tails stay as
    /// [`RangeUnit::From`]; with one, they expand and positions past the total
    /// are dropped.
    pub fn resolve(&self, total: Option<u32>) -> Vec<RangeUnit> {
        let mut ordered = self.terms.clone();
        ordered.sort_by_key(RangeTerm::start);

        let mut units = Vec::new();
        for term in ordered {
            match (term, total) {
                (RangeTerm::Single(position), _) => units.push(RangeUnit::Item(position)),
                (RangeTerm::Closed { start, end }, _) => units.extend((start..=end).map(RangeUnit::Item)),
                (RangeTerm::OpenEnded { start }, None) => units.push(RangeUnit::From(start)),
                (RangeTerm::OpenEnded { start }, Some(total)) => {
                    if start <= total {
                        units.extend((start..=total).map(RangeUnit::Item));
                    }
                }
            }
        }
        units.sort_by_key(RangeUnit::start);

        if let Some(total) = total {
            units.retain(|unit| unit.start() <= total);
        }
        units
    }

    /// Positions that fall past `total`, in resolution order.
    pub fn out_of_bounds(&self, total: u32) -> Vec<u32> {
        self.resolve(None)
            .into_iter()
            .filter_map(|unit| match unit {
                RangeUnit::Item(position) if position > total => Some(position),
                RangeUnit::From(start) if start > total => Some(start),
                _ => None,
            })
            .collect()
    }

    /// Expands against `total`, numbering each kept position from 1.
    pub fn selections(&self, total: u32) -> Vec<Selection> {
        self.resolve(Some(total))
            .into_iter()
            .filter_map(|unit| match unit {
                RangeUnit::Item(position) => Some(position),
                RangeUnit::From(_) => None,
            })
            .enumerate()
            .map(|(index, source)| Selection {
                source,
                ordinal: index + 1,
            })
            .collect()
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses `spec` and resolves it, optionally against a known total.
pub fn resolve_range(spec: &str, total: Option<u32>) -> Result<Vec<RangeUnit>, ValidationError> {
    Ok(RangeSpec::parse(spec)?.resolve(total))
}

fn parse_term(raw: &str, term: &str) -> Result<RangeTerm, ValidationError> {
    if term.is_empty() {
        return Err(ValidationError::range(raw, "empty term"));
    }

    let parts: Vec<&str> = term.split('-').collect();
    match parts.as_slice() {
        [single] => Ok(RangeTerm::Single(parse_position(raw, single)?)),
        [start, ""] => Ok(RangeTerm::OpenEnded {
            start: parse_position(raw, start)?,
        }),
        [start, end] => {
            let start = parse_position(raw, start)?;
            let end = parse_position(raw, end)?;
            if start > end {
                return Err(ValidationError::range(raw, format!("start > end in term '{term}'")));
            }
            if u64::from(end - start) + 1 > MAX_EXPANDED_ITEMS {
                return Err(ValidationError::range(
                    raw,
                    format!("term '{term}' selects more than {MAX_EXPANDED_ITEMS} items"),
                ));
            }
            Ok(RangeTerm::Closed { start, end })
        }
        _ => Err(ValidationError::range(raw, format!("malformed term '{term}'"))),
    }
}

fn parse_position(raw: &str, text: &str) -> Result<u32, ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::range(raw, "missing range start"));
    }
    if !text.chars().all(|character| character.is_ascii_digit()) {
        return Err(ValidationError::range(raw, format!("'{text}' is not a positive integer")));
    }
    let position: u32 = text
        .parse()
        .map_err(|_| ValidationError::range(raw, format!("'{text}' is out of range")))?;
    if position == 0 {
        return Err(ValidationError::range(raw, "positions start at 1"));
    }
    Ok(position)
}
