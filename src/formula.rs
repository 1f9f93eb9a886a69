//! # Formula Engine
//!
//! A small expression language over meter fields and constants, used for
//! calculated fields (`total_kwh + 12345 kwh`) and for `{...}`
//! interpolations inside field name templates. Every node carries its SI
//! dimension: addition and subtraction demand compatible dimensions at
//! parse time, multiplication and division combine them, and the result is
//! converted into the requesting field's display unit.
//!
//! Division by zero evaluates to NaN rather than failing; NaN values are
//! rendered as null downstream.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::payload::dvparser::{DVEntry, DvEntryCounterType};
use crate::units::{convert, Dim, Unit};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Unknown token at \"{0}\"")]
    UnknownToken(String),

    #[error("Unknown unit \"{0}\"")]
    UnknownUnit(String),

    #[error("Unknown field \"{0}\"")]
    UnknownField(String),

    #[error("Cannot {op} {left} and {right}, incompatible dimensions")]
    IncompatibleDimensions {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("The ^ operator is not supported")]
    UnsupportedOperator,

    #[error("Operand missing for {0}")]
    MissingOperand(&'static str),

    #[error("Cannot take square root: dimension has odd exponent")]
    BadSquareRoot,

    #[error("Trailing tokens after formula")]
    TrailingTokens,

    #[error("Missing closing parenthesis")]
    MissingParenthesis,

    #[error("Result dimension does not fit unit {0:?}")]
    BadResultUnit(Unit),

    #[error("Bad datetime literal \"{0}\"")]
    BadDateTime(String),
}

/// Resolves field references while parsing and evaluating a formula.
pub trait FieldResolver {
    /// The unit of the named field, if present.
    fn field_unit(&self, vname: &str) -> Option<Unit>;
    /// The current value of the named field, in the given unit.
    fn field_value(&self, vname: &str, unit: Unit) -> Option<f64>;
}

/// Resolver for contexts without a meter, eg name template interpolation.
pub struct NoFields;

impl FieldResolver for NoFields {
    fn field_unit(&self, _vname: &str) -> Option<Unit> {
        None
    }
    fn field_value(&self, _vname: &str, _unit: Unit) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    /// Quoted datetime literal, as seconds since the epoch.
    DateTime(f64),
    /// Quoted time literal, as seconds.
    Time(f64),
    LPar,
    RPar,
    Plus,
    Minus,
    Times,
    Div,
    Exp,
    Sqrt,
    Unit(Unit),
    Field(String),
}

fn tokenize(s: &str) -> Result<Vec<Token>, FormulaError> {
    let b: Vec<char> = s.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < b.len() {
        let c = b[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LPar);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RPar);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Times);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Div);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Exp);
                i += 1;
            }
            '\'' => {
                // Quoted datetime or time literal.
                let start = i + 1;
                let mut j = start;
                while j < b.len() && b[j] != '\'' {
                    j += 1;
                }
                if j >= b.len() {
                    return Err(FormulaError::UnknownToken(s[i..].to_string()));
                }
                let lit: String = b[start..j].iter().collect();
                tokens.push(parse_quoted_literal(&lit)?);
                i = j + 1;
            }
            '0'..='9' => {
                let mut j = i;
                while j < b.len() && (b[j].is_ascii_digit() || b[j] == '.') {
                    j += 1;
                }
                let num: String = b[i..j].iter().collect();
                let v = num
                    .parse::<f64>()
                    .map_err(|_| FormulaError::UnknownToken(num.clone()))?;
                tokens.push(Token::Number(v));
                i = j;
            }
            'a'..='z' => {
                let mut j = i;
                while j < b.len() && (b[j].is_ascii_lowercase() || b[j].is_ascii_digit() || b[j] == '_') {
                    j += 1;
                }
                let word: String = b[i..j].iter().collect();
                if word == "sqrt" {
                    tokens.push(Token::Sqrt);
                } else if let Some(u) = Unit::from_suffix(&word) {
                    tokens.push(Token::Unit(u));
                } else {
                    tokens.push(Token::Field(word));
                }
                i = j;
            }
            _ => {
                return Err(FormulaError::UnknownToken(s[i..].chars().take(8).collect()));
            }
        }
    }
    Ok(tokens)
}

fn parse_quoted_literal(lit: &str) -> Result<Token, FormulaError> {
    // Datetime: YYYY-MM-DD[ T]HH:MM[:SS][Z]
    let cleaned = lit.trim_end_matches('Z').replace('T', " ");
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Ok(Token::DateTime(dt.and_utc().timestamp() as f64));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&cleaned, "%Y-%m-%d") {
        let dt = d.and_hms_opt(0, 0, 0).unwrap();
        return Ok(Token::DateTime(dt.and_utc().timestamp() as f64));
    }
    // Time: HH:MM[:SS], as seconds.
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(&cleaned, fmt) {
            let secs = t.signed_duration_since(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
            return Ok(Token::Time(secs.num_seconds() as f64));
        }
    }
    Err(FormulaError::BadDateTime(lit.to_string()))
}

#[derive(Debug, Clone)]
enum Node {
    Constant { value: f64, unit: Unit },
    MeterField { vname: String, unit: Unit },
    Counter(DvEntryCounterType),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
    Sqrt(Box<Node>),
}

impl Node {
    fn dim(&self) -> Dim {
        match self {
            Node::Constant { unit, .. } => unit.si().0,
            Node::MeterField { unit, .. } => unit.si().0,
            Node::Counter(_) => Dim::NONE,
            Node::Add(l, _) | Node::Sub(l, _) => l.dim(),
            Node::Mul(l, r) => l.dim().mul(r.dim()),
            Node::Div(l, r) => l.dim().div(r.dim()),
            Node::Sqrt(n) => n.dim().sqrt().unwrap_or(Dim::NONE),
        }
    }

    /// Evaluate directly in the target unit. Addition and subtraction
    /// convert both operands into the target first, which keeps affine
    /// units honest: subtracting two Celsius readings yields the plain
    /// difference, not an absolute temperature.
    fn eval_unit(
        &self,
        resolver: &dyn FieldResolver,
        dve: Option<&DVEntry>,
        to: Unit,
    ) -> Option<f64> {
        match self {
            Node::Constant { value, unit } => convert(*value, *unit, to).ok(),
            Node::MeterField { vname, unit: _ } => resolver.field_value(vname, to),
            Node::Counter(ct) => dve.map(|e| e.counter(*ct)),
            Node::Add(l, r) => {
                Some(l.eval_unit(resolver, dve, to)? + r.eval_unit(resolver, dve, to)?)
            }
            Node::Sub(l, r) => {
                Some(l.eval_unit(resolver, dve, to)? - r.eval_unit(resolver, dve, to)?)
            }
            // Products have synthesised dimensions without a named unit;
            // compute on the SI scale and rescale into the target.
            Node::Mul(..) | Node::Div(..) | Node::Sqrt(..) => {
                let (_, scale, _) = to.si();
                Some(self.eval_si_scale(resolver, dve)? / scale)
            }
        }
    }

    /// Evaluate on the SI scale, offsets ignored. Used inside products,
    /// where affine offsets have no meaningful interpretation anyway.
    fn eval_si_scale(&self, resolver: &dyn FieldResolver, dve: Option<&DVEntry>) -> Option<f64> {
        match self {
            Node::Constant { value, unit } => {
                let (_, scale, _) = unit.si();
                Some(value * scale)
            }
            Node::MeterField { vname, unit } => {
                let v = resolver.field_value(vname, *unit)?;
                let (_, scale, _) = unit.si();
                Some(v * scale)
            }
            Node::Counter(ct) => dve.map(|e| e.counter(*ct)),
            Node::Add(l, r) => Some(l.eval_si_scale(resolver, dve)? + r.eval_si_scale(resolver, dve)?),
            Node::Sub(l, r) => Some(l.eval_si_scale(resolver, dve)? - r.eval_si_scale(resolver, dve)?),
            Node::Mul(l, r) => Some(l.eval_si_scale(resolver, dve)? * r.eval_si_scale(resolver, dve)?),
            Node::Div(l, r) => {
                let num = l.eval_si_scale(resolver, dve)?;
                let den = r.eval_si_scale(resolver, dve)?;
                if den == 0.0 {
                    Some(f64::NAN)
                } else {
                    Some(num / den)
                }
            }
            Node::Sqrt(n) => Some(n.eval_si_scale(resolver, dve)?.sqrt()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Node::Constant { unit, .. } => format!("{unit:?}"),
            Node::MeterField { vname, unit } => format!("{vname}_{}", unit.suffix()),
            Node::Counter(ct) => format!("{ct:?}"),
            _ => format!("{:?}", self.dim()),
        }
    }
}

/// A parsed, dimension checked formula.
#[derive(Debug, Clone)]
pub struct Formula {
    root: Node,
    text: String,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    i: usize,
    resolver: &'a dyn FieldResolver,
    stack: Vec<Node>,
}

impl<'a> Parser<'a> {
    fn la(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.i + n)
    }

    fn pop2(&mut self, op: &'static str) -> Result<(Node, Node), FormulaError> {
        let right = self.stack.pop().ok_or(FormulaError::MissingOperand(op))?;
        let left = self.stack.pop().ok_or(FormulaError::MissingOperand(op))?;
        Ok((left, right))
    }

    fn check_same_dim(
        op: &'static str,
        left: &Node,
        right: &Node,
    ) -> Result<(), FormulaError> {
        if left.dim() != right.dim() {
            return Err(FormulaError::IncompatibleDimensions {
                op,
                left: left.describe(),
                right: right.describe(),
            });
        }
        Ok(())
    }

    fn handle_field(&mut self, word: &str) -> Result<(), FormulaError> {
        // Counters for name templates.
        let counter = match word {
            "storage_counter" => Some(DvEntryCounterType::StorageCounter),
            "tariff_counter" => Some(DvEntryCounterType::TariffCounter),
            "subunit_counter" => Some(DvEntryCounterType::SubunitCounter),
            _ => None,
        };
        if let Some(ct) = counter {
            self.stack.push(Node::Counter(ct));
            return Ok(());
        }

        // A field reference ends with its unit: total_kwh -> total in KWH.
        if let Some(idx) = word.rfind('_') {
            let (vname, suffix) = (&word[..idx], &word[idx + 1..]);
            if let Some(unit) = Unit::from_suffix(suffix) {
                if self.resolver.field_unit(vname).is_some() {
                    self.stack.push(Node::MeterField {
                        vname: vname.to_string(),
                        unit,
                    });
                    return Ok(());
                }
                return Err(FormulaError::UnknownField(vname.to_string()));
            }
        }
        // Field without unit suffix: must resolve directly.
        if let Some(unit) = self.resolver.field_unit(word) {
            self.stack.push(Node::MeterField {
                vname: word.to_string(),
                unit,
            });
            return Ok(());
        }
        Err(FormulaError::UnknownField(word.to_string()))
    }

    /// Parse one operation starting at token `i`; returns the next token
    /// index. The grammar is a flat chain: each operator folds the top of
    /// the stack with the operand parsed after it.
    fn parse_ops(&mut self, i: usize) -> Result<usize, FormulaError> {
        self.i = i;
        let Some(tok) = self.la(0).cloned() else {
            return Ok(i);
        };

        match tok {
            Token::Field(word) => {
                self.handle_field(&word)?;
                Ok(i + 1)
            }
            Token::DateTime(secs) => {
                self.stack.push(Node::Constant {
                    value: secs,
                    unit: Unit::UnixTimestamp,
                });
                Ok(i + 1)
            }
            Token::Time(secs) => {
                self.stack.push(Node::Constant {
                    value: secs,
                    unit: Unit::Second,
                });
                Ok(i + 1)
            }
            Token::Plus => {
                let next = self.parse_ops(i + 1)?;
                let (l, r) = self.pop2("+")?;
                Self::check_same_dim("add", &l, &r)?;
                self.stack.push(Node::Add(Box::new(l), Box::new(r)));
                Ok(next)
            }
            Token::Minus => {
                let next = self.parse_ops(i + 1)?;
                let (l, r) = self.pop2("-")?;
                Self::check_same_dim("subtract", &l, &r)?;
                self.stack.push(Node::Sub(Box::new(l), Box::new(r)));
                Ok(next)
            }
            Token::Times => {
                let next = self.parse_ops(i + 1)?;
                let (l, r) = self.pop2("*")?;
                self.stack.push(Node::Mul(Box::new(l), Box::new(r)));
                Ok(next)
            }
            Token::Div => {
                let next = self.parse_ops(i + 1)?;
                let (l, r) = self.pop2("/")?;
                self.stack.push(Node::Div(Box::new(l), Box::new(r)));
                Ok(next)
            }
            // The exponentiation operator is lexed so the error can point
            // at it, but its semantics are left undefined.
            Token::Exp => Err(FormulaError::UnsupportedOperator),
            Token::Sqrt => {
                let next = self.parse_ops(i + 1)?;
                let n = self.stack.pop().ok_or(FormulaError::MissingOperand("sqrt"))?;
                if n.dim().sqrt().is_none() {
                    return Err(FormulaError::BadSquareRoot);
                }
                self.stack.push(Node::Sqrt(Box::new(n)));
                Ok(next)
            }
            Token::LPar => self.parse_par(i),
            Token::RPar => Ok(i),
            Token::Number(v) => {
                if let Some(Token::Unit(u)) = self.la(1) {
                    let u = *u;
                    self.stack.push(Node::Constant { value: v, unit: u });
                    Ok(i + 2)
                } else {
                    // A bare number is dimensionless.
                    self.stack.push(Node::Constant {
                        value: v,
                        unit: Unit::Number,
                    });
                    Ok(i + 1)
                }
            }
            Token::Unit(_) => Err(FormulaError::UnknownToken("unit without number".to_string())),
        }
    }

    fn parse_par(&mut self, i: usize) -> Result<usize, FormulaError> {
        let mut i = i + 1; // past the opening parenthesis
        loop {
            match self.tokens.get(i) {
                None => return Err(FormulaError::MissingParenthesis),
                Some(Token::RPar) => break,
                _ => {}
            }
            let next = self.parse_ops(i)?;
            if next == i {
                break;
            }
            i = next;
        }
        if self.tokens.get(i) != Some(&Token::RPar) {
            return Err(FormulaError::MissingParenthesis);
        }
        Ok(i + 1)
    }
}

impl Formula {
    /// Parse and dimension check a formula against the meter's fields.
    pub fn parse(text: &str, resolver: &dyn FieldResolver) -> Result<Formula, FormulaError> {
        let tokens = tokenize(text)?;
        let mut p = Parser {
            tokens,
            i: 0,
            resolver,
            stack: Vec::new(),
        };
        let mut i = 0;
        loop {
            let next = p.parse_ops(i)?;
            if next == i {
                break;
            }
            i = next;
            if i >= p.tokens.len() {
                break;
            }
        }
        if i < p.tokens.len() {
            return Err(FormulaError::TrailingTokens);
        }
        let root = p.stack.pop().ok_or(FormulaError::MissingOperand("formula"))?;
        if !p.stack.is_empty() {
            return Err(FormulaError::TrailingTokens);
        }
        Ok(Formula {
            root,
            text: text.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn dim(&self) -> Dim {
        self.root.dim()
    }

    /// Evaluate and convert the result into `to`. None when a referenced
    /// field has no value yet.
    pub fn evaluate(
        &self,
        resolver: &dyn FieldResolver,
        dve: Option<&DVEntry>,
        to: Unit,
    ) -> Result<Option<f64>, FormulaError> {
        let (dim, _, _) = to.si();
        if dim != self.root.dim() {
            return Err(FormulaError::BadResultUnit(to));
        }
        Ok(self.root.eval_unit(resolver, dve, to))
    }
}

/// Substitute `{...}` sections in a field name template.
///
/// `{storage_counter}`, `{tariff_counter}` and `{subunit_counter}` take the
/// counters of the matched record; any other content is parsed as a
/// formula and evaluated against the record.
pub fn interpolate_field_name(template: &str, dve: &DVEntry) -> Result<String, FormulaError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(FormulaError::UnknownToken(rest.to_string()));
        };
        let inner = &after[..end];
        let formula = Formula::parse(inner, &NoFields)?;
        let value = formula
            .evaluate(&NoFields, Some(dve), Unit::Number)?
            .unwrap_or(f64::NAN);
        if value.is_nan() {
            out.push_str("nan");
        } else {
            out.push_str(&format!("{}", value as i64));
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Does the template contain any `{...}` interpolation?
pub fn has_interpolation(template: &str) -> bool {
    template.contains('{')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::dif::MeasurementType;
    use crate::payload::dvparser::DifVifKey;

    struct TestMeter;

    impl FieldResolver for TestMeter {
        fn field_unit(&self, vname: &str) -> Option<Unit> {
            match vname {
                "total" => Some(Unit::KWH),
                "flow_temperature" => Some(Unit::C),
                "return_temperature" => Some(Unit::C),
                _ => None,
            }
        }
        fn field_value(&self, vname: &str, unit: Unit) -> Option<f64> {
            let v = match vname {
                "total" => 1000.0,
                "flow_temperature" => 50.0,
                "return_temperature" => 20.0,
                _ => return None,
            };
            // Stored in the field's own unit here.
            convert(v, self.field_unit(vname)?, unit).ok()
        }
    }

    fn dve(storage: u64, tariff: u32, subunit: u32) -> DVEntry {
        DVEntry {
            offset: 0,
            dif_vif_key: DifVifKey::new("0B13"),
            measurement_type: MeasurementType::Instantaneous,
            vif: 0x13,
            combinable_vifs: vec![],
            combinable_vifs_raw: vec![],
            storage_nr: storage,
            tariff_nr: tariff,
            subunit_nr: subunit,
            value: String::new(),
        }
    }

    #[test]
    fn test_add_field_and_constant() {
        let f = Formula::parse("total_kwh + 12345 kwh", &TestMeter).unwrap();
        let v = f.evaluate(&TestMeter, None, Unit::KWH).unwrap().unwrap();
        assert!((v - 13345.0).abs() < 1e-9);
    }

    #[test]
    fn test_dimension_error_at_parse_time() {
        let err = Formula::parse("total_kwh + 1 m3", &TestMeter).unwrap_err();
        assert!(matches!(err, FormulaError::IncompatibleDimensions { .. }));
    }

    #[test]
    fn test_temperature_difference() {
        let f = Formula::parse("flow_temperature_c - return_temperature_c", &TestMeter).unwrap();
        // Operands convert into the target before subtracting, so the
        // difference of two celsius readings is a plain 30.
        let v = f.evaluate(&TestMeter, None, Unit::C).unwrap().unwrap();
        assert!((v - 30.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn test_division_by_zero_is_nan() {
        let f = Formula::parse("1 kwh / 0 number", &TestMeter).unwrap();
        let v = f.evaluate(&TestMeter, None, Unit::KWH).unwrap().unwrap();
        assert!(v.is_nan());
    }

    #[test]
    fn test_exponent_is_rejected() {
        let err = Formula::parse("2 number ^ 3 number", &TestMeter).unwrap_err();
        assert_eq!(err, FormulaError::UnsupportedOperator);
    }

    #[test]
    fn test_sqrt() {
        let f = Formula::parse("sqrt (16 number)", &TestMeter).unwrap();
        let v = f.evaluate(&TestMeter, None, Unit::Number).unwrap().unwrap();
        assert!((v - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_field() {
        let err = Formula::parse("nosuch_kwh + 1 kwh", &TestMeter).unwrap_err();
        assert_eq!(err, FormulaError::UnknownField("nosuch".to_string()));
    }

    #[test]
    fn test_datetime_literal() {
        let f = Formula::parse("'2024-01-15 11:46'", &TestMeter).unwrap();
        assert_eq!(f.dim(), Dim::TIME);
    }

    #[test]
    fn test_interpolation_counters() {
        let e = dve(3, 2, 1);
        assert_eq!(
            interpolate_field_name("energy_tariff_{tariff_counter}", &e).unwrap(),
            "energy_tariff_2"
        );
        assert_eq!(
            interpolate_field_name("x_{storage_counter}_{subunit_counter}", &e).unwrap(),
            "x_3_1"
        );
    }

    #[test]
    fn test_interpolation_formula() {
        let e = dve(4, 0, 0);
        assert_eq!(
            interpolate_field_name("target_{storage_counter - 1 number}", &e).unwrap(),
            "target_3"
        );
    }
}
