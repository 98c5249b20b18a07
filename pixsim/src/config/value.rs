//! Parsing of raw configuration values into typed values.

use std::path::PathBuf;

/// A parsed configuration value.
///
/// Raw values are split into a tree of scalars and (possibly nested) lists.
/// Elements of a list are separated by whitespace or commas, and nested lists
/// are delimited by square brackets, so that `1 2 3`, `1, 2, 3` and `[1,2,3]`
/// all describe the same list while `[[1, 0], [0, 1]]` describes a matrix.
/// Quoted text (single or double quotes) is always a single scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A single textual value.
    Scalar(String),
    /// An ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Parses a raw configuration value.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parser = Parser {
            chars: raw.chars().collect(),
            pos: 0,
        };
        let mut items = parser.items(false)?;

        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(Value::List(items))
        }
    }

    /// Returns the single scalar held by this value.
    ///
    /// A list with exactly one element is transparently unwrapped.
    pub fn as_scalar(&self) -> Result<&str, String> {
        match self {
            Value::Scalar(s) => Ok(s),
            Value::List(items) if items.len() == 1 => items[0].as_scalar(),
            Value::List(items) => Err(format!(
                "expected a single value, found a list of {} elements",
                items.len()
            )),
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn items(&mut self, nested: bool) -> Result<Vec<Value>, String> {
        let mut items = Vec::new();
        loop {
            while matches!(self.peek(), Some(c) if c.is_whitespace() || c == ',') {
                self.pos += 1;
            }
            match self.peek() {
                None if nested => return Err("unterminated '['".to_string()),
                None => return Ok(items),
                Some(']') if nested => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(']') => return Err("unmatched ']'".to_string()),
                Some('[') => {
                    self.pos += 1;
                    items.push(Value::List(self.items(true)?));
                }
                Some(quote @ ('"' | '\'')) => {
                    self.pos += 1;
                    items.push(Value::Scalar(self.quoted(quote)?));
                }
                Some(_) => items.push(Value::Scalar(self.bare())),
            }
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let text = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(text);
            }
            self.pos += 1;
        }
        Err(format!("missing closing {quote}"))
    }

    fn bare(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, ',' | '[' | ']' | '"' | '\'') {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

/// A type that can be read from a configuration value.
///
/// Implementations are provided for strings, paths, booleans, all primitive
/// numeric types, vectors (`Vec<T>`), fixed-size arrays (`[T; N]`, e.g. 2D and
/// 3D vectors) and by composition matrices (`Vec<Vec<T>>`).
///
/// Module authors may implement this trait for their own types, for instance
/// to read an enumeration:
///
/// ```
/// use pixsim::config::{FromConfig, Value};
///
/// enum Polarity {
///     Electrons,
///     Holes,
/// }
///
/// impl FromConfig for Polarity {
///     fn from_value(value: &Value) -> Result<Self, String> {
///         match value.as_scalar()?.to_ascii_lowercase().as_str() {
///             "electrons" => Ok(Polarity::Electrons),
///             "holes" => Ok(Polarity::Holes),
///             other => Err(format!("unknown polarity '{other}'")),
///         }
///     }
/// }
/// ```
pub trait FromConfig: Sized {
    /// Converts a parsed value, returning a human-readable reason on failure.
    fn from_value(value: &Value) -> Result<Self, String>;
}

macro_rules! from_config_via_parse {
    ($($ty:ty),*) => {
        $(
            impl FromConfig for $ty {
                fn from_value(value: &Value) -> Result<Self, String> {
                    value.as_scalar()?.parse::<$ty>().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

from_config_via_parse!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl FromConfig for bool {
    fn from_value(value: &Value) -> Result<Self, String> {
        let text = value.as_scalar()?;
        if text.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if text.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(format!("'{text}' is neither 'true' nor 'false'"))
        }
    }
}

impl FromConfig for String {
    fn from_value(value: &Value) -> Result<Self, String> {
        value.as_scalar().map(str::to_owned)
    }
}

impl FromConfig for PathBuf {
    fn from_value(value: &Value) -> Result<Self, String> {
        value.as_scalar().map(PathBuf::from)
    }
}

impl<T: FromConfig> FromConfig for Vec<T> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::List(items) => items.iter().map(T::from_value).collect(),
            scalar => Ok(vec![T::from_value(scalar)?]),
        }
    }
}

impl<T: FromConfig, const N: usize> FromConfig for [T; N] {
    fn from_value(value: &Value) -> Result<Self, String> {
        let items = Vec::<T>::from_value(value)?;
        let len = items.len();

        items
            .try_into()
            .map_err(|_| format!("expected {N} elements, found {len}"))
    }
}
