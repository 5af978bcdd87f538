//! Parsing of the `_stream` comment that application writes attach to
//! every DML, carrying the table name and primary-key values for replay.
//!
//! Example: `insert into moves(foo) values ('x') /* _stream moves (id name
//! ) (null 'bmFtZQ==' ); */`. A `null` stands for an auto-increment value
//! filled in from the preceding `SET INSERT_ID`. String values are base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, multispace0};
use nom::combinator::{map, recognize, value};
use nom::multi::many1;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;
use oxherd_errors::{OxherdError, OxherdResult};

use crate::events::PkValue;

/// Marker that introduces the stream comment inside a DML.
pub const STREAM_COMMENT_START: &str = "/* _stream ";

/// A raw value inside a pk tuple; `Null` consumes an auto-increment id.
#[derive(Clone, Debug, PartialEq)]
pub enum RawPkValue {
    Null,
    Number(String),
    Base64(String),
    Word(String),
}

/// The decoded `_stream` comment.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamComment {
    pub table: String,
    pub pk_col_names: Vec<String>,
    pub pk_tuples: Vec<Vec<RawPkValue>>,
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(multispace0, inner)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.')(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        nom::combinator::opt(char('-')),
        take_while1(|c: char| c.is_ascii_digit() || c == '.'),
    ))(input)
}

fn base64_string(input: &str) -> IResult<&str, &str> {
    delimited(char('\''), take_while1(|c: char| c != '\''), char('\''))(input)
}

fn pk_value(input: &str) -> IResult<&str, RawPkValue> {
    alt((
        value(RawPkValue::Null, tag("null")),
        map(base64_string, |s: &str| RawPkValue::Base64(s.to_owned())),
        map(number, |s: &str| RawPkValue::Number(s.to_owned())),
        map(identifier, |s: &str| RawPkValue::Word(s.to_owned())),
    ))(input)
}

fn name_tuple(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        many1(map(ws(identifier), |s: &str| s.to_owned())),
        ws(char(')')),
    )(input)
}

fn value_tuple(input: &str) -> IResult<&str, Vec<RawPkValue>> {
    delimited(ws(char('(')), many1(ws(pk_value)), ws(char(')')))(input)
}

fn stream_comment(input: &str) -> IResult<&str, StreamComment> {
    let (input, table) = ws(identifier)(input)?;
    let (input, pk_col_names) = name_tuple(input)?;
    let (input, pk_tuples) = many1(value_tuple)(input)?;
    let (input, _) = ws(char(';'))(input)?;
    Ok((
        input,
        StreamComment {
            table: table.to_owned(),
            pk_col_names,
            pk_tuples,
        },
    ))
}

/// Parse the body of a stream comment (everything after the marker, up to
/// and excluding the closing `*/`).
pub fn parse_stream_comment(body: &str) -> OxherdResult<StreamComment> {
    match stream_comment(body) {
        Ok((_, comment)) => {
            for tuple in &comment.pk_tuples {
                if tuple.len() != comment.pk_col_names.len() {
                    return Err(OxherdError::Parse(format!(
                        "stream comment pk tuple length {} does not match column count {}",
                        tuple.len(),
                        comment.pk_col_names.len()
                    )));
                }
            }
            Ok(comment)
        }
        Err(e) => Err(OxherdError::Parse(format!(
            "cannot parse stream comment {body:?}: {e}"
        ))),
    }
}

/// Resolve raw pk values into typed ones. `null` placeholders take
/// successive auto-increment ids starting at `autoinc_id`.
pub fn resolve_pk_values(
    tuples: &[Vec<RawPkValue>],
    mut autoinc_id: u64,
) -> OxherdResult<Vec<Vec<PkValue>>> {
    let mut rows = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        let mut row = Vec::with_capacity(tuple.len());
        for raw in tuple {
            row.push(match raw {
                RawPkValue::Null => {
                    let v = PkValue::Uint(autoinc_id);
                    autoinc_id += 1;
                    v
                }
                RawPkValue::Number(text) => parse_number(text)?,
                RawPkValue::Base64(text) => {
                    let decoded = BASE64.decode(text.as_bytes()).map_err(|e| {
                        OxherdError::Parse(format!("bad base64 pk value {text:?}: {e}"))
                    })?;
                    PkValue::Str(String::from_utf8_lossy(&decoded).into_owned())
                }
                RawPkValue::Word(text) => PkValue::Str(text.clone()),
            });
        }
        rows.push(row);
    }
    Ok(rows)
}

fn parse_number(text: &str) -> OxherdResult<PkValue> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(PkValue::Int(v));
    }
    if let Ok(v) = text.parse::<u64>() {
        return Ok(PkValue::Uint(v));
    }
    if let Ok(v) = text.parse::<f64>() {
        return Ok(PkValue::Float(v));
    }
    Err(OxherdError::Parse(format!("bad numeric pk value {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table_names_columns_and_tuples() {
        let comment =
            parse_stream_comment("moves (eid id name ) (null 1 'bmFtZQ==' ); ").unwrap();
        assert_eq!(comment.table, "moves");
        assert_eq!(comment.pk_col_names, vec!["eid", "id", "name"]);
        assert_eq!(comment.pk_tuples.len(), 1);

        let rows = resolve_pk_values(&comment.pk_tuples, 41).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                PkValue::Uint(41),
                PkValue::Int(1),
                PkValue::Str("name".into()),
            ]]
        );
    }

    #[test]
    fn multi_row_updates_carry_one_tuple_per_row() {
        let comment =
            parse_stream_comment("moves (id ) (1 ) (2 ) (-3 ); ").unwrap();
        assert_eq!(comment.pk_tuples.len(), 3);
        let rows = resolve_pk_values(&comment.pk_tuples, 0).unwrap();
        assert_eq!(rows[2], vec![PkValue::Int(-3)]);
    }

    #[test]
    fn successive_nulls_consume_successive_autoinc_ids() {
        let comment = parse_stream_comment("moves (id ) (null ) (null ); ").unwrap();
        let rows = resolve_pk_values(&comment.pk_tuples, 10).unwrap();
        assert_eq!(rows, vec![vec![PkValue::Uint(10)], vec![PkValue::Uint(11)]]);
    }

    #[test]
    fn mismatched_tuple_length_is_an_error() {
        assert!(parse_stream_comment("moves (a b ) (1 ); ").is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_stream_comment("( ) ; ").is_err());
        assert!(parse_stream_comment("").is_err());
    }
}
