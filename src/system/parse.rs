//! Parser for the textual system format.

use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use super::{Arg, Constructor, System, SystemError};

#[derive(Parser)]
#[grammar = "system/system.pest"]
struct SystemParser;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("parse error:\n{0}")]
    Grammar(Box<pest::error::Error<Rule>>),
    #[error("duplicate definition of type {0}")]
    DuplicateType(String),
    #[error("constructor {0}: bad weight {1}")]
    BadWeight(String, String),
    #[error("constructor {0}: bad frequency {1}")]
    BadFrequency(String, String),
    #[error("constructor {0}: more than one weight annotation")]
    DuplicateWeight(String),
    #[error("constructor {0}: more than one frequency annotation")]
    DuplicateFrequency(String),
    #[error(transparent)]
    System(#[from] SystemError),
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        ParseError::Grammar(Box::new(err))
    }
}

/// Parses a system specification from source text and validates it.
///
/// # Errors
///
/// Returns a [`ParseError`] on malformed input or an invalid system.
pub fn parse_system(input: &str) -> Result<System, ParseError> {
    let file = SystemParser::parse(Rule::file, input)?
        .next()
        .expect("grammar yields exactly one file");

    let mut annotations = IndexMap::new();
    let mut types = IndexMap::new();

    for pair in file.into_inner() {
        match pair.as_rule() {
            Rule::preamble => {
                let mut inner = pair.into_inner();
                let key = inner.next().expect("preamble key").as_str().to_owned();
                let value = inner
                    .next()
                    .expect("preamble value")
                    .as_str()
                    .trim()
                    .to_owned();
                annotations.insert(key, value);
            }
            Rule::definition => {
                let mut inner = pair.into_inner();
                let name = inner.next().expect("type name").as_str().to_owned();
                let constructors = inner
                    .map(parse_constructor)
                    .collect::<Result<Vec<_>, _>>()?;
                if types.insert(name.clone(), constructors).is_some() {
                    return Err(ParseError::DuplicateType(name));
                }
            }
            Rule::EOI => {}
            rule => unreachable!("unexpected rule {rule:?} at file level"),
        }
    }

    Ok(System::new(types, annotations)?)
}

fn parse_constructor(pair: pest::iterators::Pair<Rule>) -> Result<Constructor, ParseError> {
    debug_assert_eq!(pair.as_rule(), Rule::constructor);
    let mut inner = pair.into_inner();
    let name = inner.next().expect("constructor name").as_str().to_owned();

    let mut args = Vec::new();
    let mut weight = None;
    let mut frequency = None;

    for part in inner {
        match part.as_rule() {
            Rule::carg => {
                let arg = part.into_inner().next().expect("argument kind");
                match arg.as_rule() {
                    Rule::ty_arg => args.push(Arg::Ty(arg.as_str().to_owned())),
                    Rule::seq_arg => {
                        let elem = arg.into_inner().next().expect("element type");
                        args.push(Arg::Seq(elem.as_str().to_owned()));
                    }
                    rule => unreachable!("unexpected argument rule {rule:?}"),
                }
            }
            Rule::annot => {
                let annot = part.into_inner().next().expect("annotation kind");
                match annot.as_rule() {
                    Rule::weight => {
                        let text = annot.into_inner().next().expect("weight value").as_str();
                        let value = text
                            .parse::<u64>()
                            .map_err(|_| ParseError::BadWeight(name.clone(), text.to_owned()))?;
                        if weight.replace(value).is_some() {
                            return Err(ParseError::DuplicateWeight(name));
                        }
                    }
                    Rule::freq => {
                        let text = annot.into_inner().next().expect("frequency value").as_str();
                        let value = text.parse::<f64>().map_err(|_| {
                            ParseError::BadFrequency(name.clone(), text.to_owned())
                        })?;
                        if frequency.replace(OrderedFloat(value)).is_some() {
                            return Err(ParseError::DuplicateFrequency(name));
                        }
                    }
                    rule => unreachable!("unexpected annotation rule {rule:?}"),
                }
            }
            rule => unreachable!("unexpected constructor rule {rule:?}"),
        }
    }

    Ok(Constructor {
        name,
        args,
        // a constructor contributes one atom unless annotated otherwise
        weight: weight.unwrap_or(1),
        frequency,
    })
}
