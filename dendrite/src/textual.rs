//! Self-describing textual encoding of values.
//!
//! This is the form slot values take inside write-ahead log records:
//!
//! ```text
//! nil  true  false  n:<double>  s:<escaped>  l:[...]  m:{k=v,...}
//! o:<object_id>  h:<handle_id>:<kind>
//! ```
//!
//! The encoding is lossless for every value kind except foreign handles,
//! which carry only `{handle_id, kind}` and are re-resolved on replay.
//! The reader is lenient about padding whitespace between tokens; the
//! writer escapes everything that would be mistaken for padding (tabs,
//! newlines, and spaces at the boundaries of strings and keys), so values
//! survive field trimming intact.

use crate::error::{Error, Result};
use crate::value::{HandleKind, HandleRef, ObjectId, Value};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_res};
use nom::multi::separated_list0;
use nom::number::complete::double;
use nom::sequence::{delimited, preceded, separated_pair, terminated};
use nom::IResult;

/// Characters that must be escaped inside strings and map keys so records
/// stay line- and field-splittable. Spaces are escaped (as `\s`) only at
/// the first and last position, where a lenient reader would otherwise
/// strip them as padding.
const ESCAPED: &[char] = &['\\', '\t', '\n', '\r', ',', ']', '}', '=', ':'];

fn push_escaped(out: &mut String, s: &str) {
    for (at, c) in s.char_indices() {
        let boundary = at == 0 || at + c.len_utf8() == s.len();
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' ' if boundary => out.push_str("\\s"),
            c if ESCAPED.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn encode_into(value: &Value, out: &mut String) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            out.push_str("n:");
            if n.is_nan() {
                out.push_str("NaN");
            } else if n.is_infinite() {
                out.push_str(if *n > 0.0 { "inf" } else { "-inf" });
            } else {
                out.push_str(&n.to_string());
            }
        }
        Value::String(s) => {
            out.push_str("s:");
            push_escaped(out, s);
        }
        Value::List(items) => {
            out.push_str("l:[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_into(item, out);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push_str("m:{");
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_escaped(out, key);
                out.push('=');
                encode_into(item, out);
            }
            out.push('}');
        }
        Value::Object(id) => {
            out.push_str("o:");
            out.push_str(&id.to_string());
        }
        Value::ForeignHandle(handle) => {
            out.push_str("h:");
            push_escaped(out, &handle.handle_id);
            out.push(':');
            out.push_str(&handle.kind.to_string());
        }
    }
}

/// Encode a value into its textual form.
pub fn encode(value: &Value) -> String {
    let mut out = String::new();
    encode_into(value, &mut out);
    out
}

/// Escape a bare record field (e.g. a slot name) with the same rules as
/// string payloads, so tabs and newlines cannot break line framing.
pub(crate) fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    push_escaped(&mut out, field);
    out
}

pub(crate) fn unescape_field(field: &str) -> Result<String> {
    match escaped_text(field) {
        Ok(("", out)) => Ok(out),
        _ => Err(Error::MalformedRecord(format!(
            "unparseable field '{}'",
            field
        ))),
    }
}

/// Decode a full textual form back into a value.
pub fn decode(input: &str) -> Result<Value> {
    match terminated(parse_value, multispace0)(input.trim()) {
        Ok(("", value)) => Ok(value),
        Ok((rest, _)) => Err(Error::MalformedRecord(format!(
            "trailing input '{}'",
            rest.trim()
        ))),
        Err(err) => Err(Error::MalformedRecord(format!(
            "unparseable value '{}': {}",
            input.trim(),
            err
        ))),
    }
}

fn parse_value(input: &str) -> IResult<&str, Value> {
    preceded(
        multispace0,
        alt((
            map(tag("nil"), |_| Value::Nil),
            map(tag("true"), |_| Value::Bool(true)),
            map(tag("false"), |_| Value::Bool(false)),
            parse_number,
            parse_string,
            parse_list,
            parse_map,
            parse_object,
            parse_handle,
        )),
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, Value> {
    preceded(tag("n:"), map(double, Value::Number))(input)
}

fn parse_string(input: &str) -> IResult<&str, Value> {
    preceded(tag("s:"), map(escaped_text, Value::String))(input)
}

/// Consumes escaped text up to (but not including) the first unescaped
/// delimiter or end of input.
fn escaped_text(input: &str) -> IResult<&str, String> {
    let mut out = String::new();
    let mut chars = input.char_indices();
    let mut consumed = input.len();
    while let Some((at, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 't')) => out.push('\t'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 's')) => out.push(' '),
                Some((_, escaped)) => out.push(escaped),
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::EscapedTransform,
                    )))
                }
            },
            ',' | ']' | '}' | '=' | ':' | '\t' | '\n' | '\r' => {
                consumed = at;
                break;
            }
            c => out.push(c),
        }
    }
    Ok((&input[consumed..], out))
}

fn parse_list(input: &str) -> IResult<&str, Value> {
    map(
        preceded(
            tag("l:"),
            delimited(
                char('['),
                terminated(
                    separated_list0(preceded(multispace0, char(',')), parse_value),
                    multispace0,
                ),
                char(']'),
            ),
        ),
        Value::List,
    )(input)
}

fn parse_map(input: &str) -> IResult<&str, Value> {
    let entry = separated_pair(
        preceded(multispace0, escaped_text),
        char('='),
        parse_value,
    );
    map(
        preceded(
            tag("m:"),
            delimited(
                char('{'),
                terminated(
                    separated_list0(preceded(multispace0, char(',')), entry),
                    multispace0,
                ),
                char('}'),
            ),
        ),
        |entries| Value::Map(entries.into_iter().collect()),
    )(input)
}

fn parse_object(input: &str) -> IResult<&str, Value> {
    preceded(
        tag("o:"),
        map(
            map_res(digit1, |digits: &str| digits.parse::<u64>()),
            |raw| Value::Object(ObjectId(raw)),
        ),
    )(input)
}

fn parse_handle(input: &str) -> IResult<&str, Value> {
    let kind = map_res(
        alt((tag("n2f"), tag("f2n"))),
        |token: &str| token.parse::<HandleKind>(),
    );
    map(
        preceded(tag("h:"), separated_pair(escaped_text, char(':'), kind)),
        |(handle_id, kind)| Value::ForeignHandle(HandleRef { handle_id, kind }),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::testing::arb_plain_value;
    use indexmap::IndexMap;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::Nil, "nil")]
    #[case(Value::Bool(true), "true")]
    #[case(Value::Bool(false), "false")]
    #[case(Value::Number(42.0), "n:42")]
    #[case(Value::Number(-0.5), "n:-0.5")]
    #[case(Value::String("red".into()), "s:red")]
    #[case(Value::Object(ObjectId(17)), "o:17")]
    fn encodes_scalars(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(encode(&value), expected);
        assert_eq!(decode(expected).unwrap(), value);
    }

    #[test]
    fn encodes_nested_collections() {
        let mut entries = IndexMap::new();
        entries.insert("x".to_string(), Value::Number(1.0));
        entries.insert(
            "xs".to_string(),
            Value::List(vec![Value::Nil, Value::String("a,b".into())]),
        );
        let value = Value::Map(entries);
        let text = encode(&value);
        assert_eq!(text, "m:{x=n:1,xs=l:[nil,s:a\\,b]}");
        assert_eq!(decode(&text).unwrap(), value);
    }

    #[test]
    fn escapes_tabs_and_newlines() {
        let value = Value::String("a\tb\nc".into());
        let text = encode(&value);
        assert!(!text.contains('\t'));
        assert!(!text.contains('\n'));
        assert_eq!(decode(&text).unwrap(), value);
    }

    #[rstest]
    #[case(" ")]
    #[case("  ")]
    #[case("   ")]
    #[case("red ")]
    #[case(" red")]
    #[case("  padded  ")]
    #[case("interior space ")]
    fn boundary_whitespace_in_strings_survives(#[case] s: &str) {
        let value = Value::String(s.to_string());
        let text = encode(&value);
        // The encoded form never starts or ends with raw whitespace, so a
        // trimming reader cannot eat into the payload.
        assert!(!text.starts_with(char::is_whitespace));
        assert!(!text.ends_with(char::is_whitespace));
        assert_eq!(decode(&text).unwrap(), value);
        // Padding around the whole token is still insignificant.
        assert_eq!(decode(&format!("  {}  ", text)).unwrap(), value);
    }

    #[test]
    fn boundary_whitespace_in_map_keys_survives() {
        let mut entries = IndexMap::new();
        entries.insert(" k".to_string(), Value::Number(1.0));
        entries.insert("k ".to_string(), Value::Number(2.0));
        entries.insert(" ".to_string(), Value::Number(3.0));
        let value = Value::Map(entries);
        let text = encode(&value);
        assert_eq!(text, "m:{\\sk=n:1,k\\s=n:2,\\s=n:3}");
        assert_eq!(decode(&text).unwrap(), value);

        // Raw padding before a key is still read as padding, not content.
        let mut plain = IndexMap::new();
        plain.insert("k".to_string(), Value::Number(1.0));
        assert_eq!(decode("m:{ k=n:1}").unwrap(), Value::Map(plain));
    }

    #[test]
    fn handles_round_trip_as_id_and_kind_only() {
        let value = Value::ForeignHandle(HandleRef {
            handle_id: "h000042".to_string(),
            kind: HandleKind::ForeignToNative,
        });
        let text = encode(&value);
        assert_eq!(text, "h:h000042:f2n");
        assert_eq!(decode(&text).unwrap(), value);
    }

    #[test]
    fn reader_is_lenient_about_surrounding_whitespace() {
        // Unescaped whitespace around a *string* is part of the string, so
        // leniency applies everywhere else: around the value as a whole and
        // between non-string tokens.
        let parsed = decode("  l:[ n:1 ,s:hi, m:{ k= true } ]  ").unwrap();
        let mut entries = IndexMap::new();
        entries.insert("k".to_string(), Value::Bool(true));
        assert_eq!(
            parsed,
            Value::List(vec![
                Value::Number(1.0),
                Value::String("hi".into()),
                Value::Map(entries),
            ])
        );
    }

    #[test]
    fn non_finite_numbers_survive() {
        for value in [
            Value::Number(f64::INFINITY),
            Value::Number(f64::NEG_INFINITY),
        ] {
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
        match decode(&encode(&Value::Number(f64::NAN))).unwrap() {
            Value::Number(n) => assert!(n.is_nan()),
            other => panic!("expected number, got {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("q:whatever").is_err());
        assert!(decode("n:1 n:2").is_err());
        assert!(decode("l:[n:1").is_err());
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_plain_values(value in arb_plain_value()) {
            prop_assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }
}
