//! Coercion of raw statistic strings into typed values.

use matchfeed_core::{MatchStats, RawPair, StatKind, StatPair, StatValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which half of an `"x/y"` parenthetical a fraction field keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FractionPolicy {
    /// Successful count, e.g. completed tackles.
    Numerator,
    /// Total attempts, e.g. crosses.
    Denominator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberKind {
    Count,
    Rate,
    Percentage,
    Fraction(FractionPolicy),
}

#[derive(Debug, Clone, Copy)]
pub struct StatField {
    pub label: &'static str,
    pub kind: StatKind,
    pub number: NumberKind,
}

const fn field(label: &'static str, kind: StatKind, number: NumberKind) -> StatField {
    StatField { label, kind, number }
}

/// Source labels (Italian and English layouts) and how each one coerces.
pub const STAT_FIELDS: &[StatField] = &[
    field("Calci d'angolo", StatKind::Corners, NumberKind::Count),
    field("Corner Kicks", StatKind::Corners, NumberKind::Count),
    field("Falli", StatKind::Fouls, NumberKind::Count),
    field("Fouls", StatKind::Fouls, NumberKind::Count),
    field("Ammonizioni", StatKind::YellowCards, NumberKind::Count),
    field("Cartellini gialli", StatKind::YellowCards, NumberKind::Count),
    field("Yellow Cards", StatKind::YellowCards, NumberKind::Count),
    field("Espulsioni", StatKind::RedCards, NumberKind::Count),
    field("Cartellini rossi", StatKind::RedCards, NumberKind::Count),
    field("Red Cards", StatKind::RedCards, NumberKind::Count),
    field("Tiri totali", StatKind::Shots, NumberKind::Count),
    field("Total shots", StatKind::Shots, NumberKind::Count),
    field("Tiri in porta", StatKind::ShotsOnTarget, NumberKind::Count),
    field("Shots on target", StatKind::ShotsOnTarget, NumberKind::Count),
    field("Tiri fermati", StatKind::BlockedShots, NumberKind::Count),
    field("Blocked Shots", StatKind::BlockedShots, NumberKind::Count),
    field("Possesso palla", StatKind::Possession, NumberKind::Percentage),
    field("Ball Possession", StatKind::Possession, NumberKind::Percentage),
    field("Goal previsti (xG)", StatKind::Xg, NumberKind::Rate),
    field("Expected Goals (xG)", StatKind::Xg, NumberKind::Rate),
    field("xG sui Tiri in porta (xGOT)", StatKind::Xgot, NumberKind::Rate),
    field("xG on target (xGOT)", StatKind::Xgot, NumberKind::Rate),
    field("Grandi occasioni", StatKind::BigChances, NumberKind::Count),
    field("Big Chances", StatKind::BigChances, NumberKind::Count),
    field("Palloni toccati nell'area avversaria", StatKind::BoxTouches, NumberKind::Count),
    field("Touches in opposition box", StatKind::BoxTouches, NumberKind::Count),
    field("Cross", StatKind::Crosses, NumberKind::Fraction(FractionPolicy::Denominator)),
    field("Crosses", StatKind::Crosses, NumberKind::Fraction(FractionPolicy::Denominator)),
    field("Contrasti", StatKind::Tackles, NumberKind::Fraction(FractionPolicy::Numerator)),
    field("Tackles", StatKind::Tackles, NumberKind::Fraction(FractionPolicy::Numerator)),
    field("Parate", StatKind::GoalkeeperSaves, NumberKind::Count),
    field("Goalkeeper Saves", StatKind::GoalkeeperSaves, NumberKind::Count),
    field("Palle intercettate", StatKind::Interceptions, NumberKind::Count),
    field("Interceptions", StatKind::Interceptions, NumberKind::Count),
];

/// A label/value row exactly as extracted from a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatPair {
    pub label: String,
    pub home: String,
    pub away: String,
}

fn canonical_label(label: &str) -> String {
    label.trim().replace('\u{2019}', "'").to_lowercase()
}

pub fn lookup_field(label: &str) -> Option<&'static StatField> {
    let wanted = canonical_label(label);
    STAT_FIELDS
        .iter()
        .find(|field| canonical_label(field.label) == wanted)
}

/// Converts one raw value. `None` means "not observed"; callers must omit the
/// side rather than store a zero.
pub fn coerce(raw: &str, kind: NumberKind) -> Option<StatValue> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return None;
    }

    match kind {
        NumberKind::Count => {
            let value = parse_locale_number(raw)?;
            (value.fract() == 0.0).then_some(StatValue::Int(value as i64))
        }
        NumberKind::Rate => parse_locale_number(raw).map(StatValue::Float),
        NumberKind::Percentage => {
            let head = raw.split('(').next().unwrap_or(raw);
            let value = parse_locale_number(head.trim().trim_end_matches('%').trim())?;
            Some(integral_or_float(value))
        }
        NumberKind::Fraction(policy) => {
            let Some((numerator, denominator)) = fraction_parts(raw) else {
                // No "x/y" part published; a bare number is already the count.
                return coerce(raw, NumberKind::Count);
            };
            let chosen = match policy {
                FractionPolicy::Numerator => numerator,
                FractionPolicy::Denominator => denominator,
            };
            chosen.trim().parse::<i64>().ok().map(StatValue::Int)
        }
    }
}

fn integral_or_float(value: f64) -> StatValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        StatValue::Int(value as i64)
    } else {
        StatValue::Float(value)
    }
}

/// Finds `x/y` inside parentheses (`"19% (4/21)"`) or as the whole value (`"4/21"`).
fn fraction_parts(raw: &str) -> Option<(&str, &str)> {
    let inner = match (raw.find('('), raw.rfind(')')) {
        (Some(open), Some(close)) if open < close => &raw[open + 1..close],
        _ => raw,
    };
    inner.split_once('/')
}

/// Parses numbers published with either `.` or `,` as decimal separator.
/// A single separator followed by exactly three digits reads as thousands.
fn parse_locale_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            let (decimal, thousands) = if dot > comma { ('.', ',') } else { (',', '.') };
            cleaned.replace(thousands, "").replace(decimal, ".")
        }
        (Some(_), None) => single_separator(&cleaned, '.'),
        (None, Some(_)) => single_separator(&cleaned, ','),
        (None, None) => cleaned,
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn single_separator(cleaned: &str, sep: char) -> String {
    let occurrences = cleaned.matches(sep).count();
    let digits_after = cleaned
        .rsplit(sep)
        .next()
        .map(|tail| tail.chars().filter(char::is_ascii_digit).count())
        .unwrap_or(0);
    if occurrences > 1 || digits_after == 3 {
        cleaned.replace(sep, "")
    } else {
        cleaned.replace(sep, ".")
    }
}

/// Maps raw rows onto typed statistics. Unknown labels land in `unmapped`.
pub fn coerce_stats(rows: &[RawStatPair]) -> MatchStats {
    let mut stats = MatchStats::default();
    for row in rows {
        match lookup_field(&row.label) {
            Some(field) => {
                let pair = StatPair {
                    home: coerce(&row.home, field.number),
                    away: coerce(&row.away, field.number),
                };
                if pair.home.is_none() && pair.away.is_none() {
                    debug!(label = %row.label, home = %row.home, away = %row.away, "statistic did not coerce");
                    continue;
                }
                stats.insert(field.kind, pair);
            }
            None => {
                stats.unmapped.insert(
                    row.label.trim().to_string(),
                    RawPair {
                        home: row.home.clone(),
                        away: row.away.clone(),
                    },
                );
            }
        }
    }
    stats
}
