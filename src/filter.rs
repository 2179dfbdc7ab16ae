//! The predicate language behind `mover_constraint` and friends.
//!
//! A predicate is a boolean expression over the entities of a query
//! context, e.g.
//!
//! ```text
//! actor.strength >= 10 && target.type = "boulder"
//! ```
//!
//! Subjects are `target`, `actor` and `tool`; `.type` compares against the
//! type chain, any other segment reads a property with type fall-through.
//! A filter property may also be a map `{predicate, message}`; the message
//! is reported through the error sink when the predicate rejects.

use smol_str::SmolStr;
use thiserror::Error;

use crate::element::Element;
use crate::entity::Entities;
use crate::typeinfo::TypeRegistry;
use crate::EntityId;

/// A parsed, reusable predicate with its optional rejection message.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
  expr: Expr,
  message: Option<String>,
}

/// Who the predicate is being asked about.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext {
  pub target: EntityId,
  pub actor: EntityId,
  pub tool: Option<EntityId>,
}

impl FilterSpec {
  /// Parse a filter property value: either a predicate string or a map
  /// with `predicate` and optional `message`.
  pub fn from_element(value: &Element) -> Result<FilterSpec, FilterParseError> {
    match value {
      Element::String(src) => FilterSpec::parse(src, None),
      Element::Map(map) => {
        let src = map
          .get("predicate")
          .and_then(Element::as_str)
          .ok_or(FilterParseError::MissingPredicate)?;
        let message = map
          .get("message")
          .and_then(Element::as_str)
          .map(str::to_owned);
        FilterSpec::parse(src, message)
      }
      other => Err(FilterParseError::BadValue(other.kind())),
    }
  }

  pub fn parse(
    src: &str,
    message: Option<String>,
  ) -> Result<FilterSpec, FilterParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
      return Err(FilterParseError::TrailingInput);
    }
    Ok(FilterSpec { expr, message })
  }

  /// Evaluate against a context. On rejection, the configured message (if
  /// any) is pushed into `errors`.
  pub fn matches(
    &self,
    ctx: QueryContext,
    entities: &Entities,
    types: &TypeRegistry,
    errors: &mut Vec<String>,
  ) -> bool {
    let ok = self.expr.eval(ctx, entities, types);
    if !ok {
      if let Some(message) = &self.message {
        errors.push(message.clone());
      }
    }
    ok
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
  Or(Vec<Expr>),
  And(Vec<Expr>),
  Cmp(Operand, RelOp, Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  In,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
  Path(Subject, SmolStr),
  Literal(Element),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
  Target,
  Actor,
  Tool,
}

/// What a path resolved to.
enum Resolved {
  Value(Element),
  Type(SmolStr),
  Missing,
}

impl Expr {
  fn eval(
    &self,
    ctx: QueryContext,
    entities: &Entities,
    types: &TypeRegistry,
  ) -> bool {
    match self {
      Expr::Or(arms) => arms.iter().any(|a| a.eval(ctx, entities, types)),
      Expr::And(arms) => arms.iter().all(|a| a.eval(ctx, entities, types)),
      Expr::Cmp(lhs, op, rhs) => {
        let lhs = resolve(lhs, ctx, entities, types);
        let rhs = resolve(rhs, ctx, entities, types);
        compare(&lhs, *op, &rhs, types)
      }
    }
  }
}

fn resolve(
  operand: &Operand,
  ctx: QueryContext,
  entities: &Entities,
  types: &TypeRegistry,
) -> Resolved {
  match operand {
    Operand::Literal(e) => Resolved::Value(e.clone()),
    Operand::Path(subject, segment) => {
      let id = match subject {
        Subject::Target => Some(ctx.target),
        Subject::Actor => Some(ctx.actor),
        Subject::Tool => ctx.tool,
      };
      let Some(entity) = id.and_then(|id| entities.get(id)) else {
        return Resolved::Missing;
      };
      match segment.as_str() {
        "type" => Resolved::Type(entity.type_name.clone()),
        "id" => Resolved::Value(Element::Int(entity.id.0 as i64)),
        name => match entity.attr(name) {
          Some(value) => Resolved::Value(value.clone()),
          None => match types.default_for(&entity.type_name, name) {
            Some(value) => Resolved::Value(value.clone()),
            None => Resolved::Missing,
          },
        },
      }
    }
  }
}

fn compare(
  lhs: &Resolved,
  op: RelOp,
  rhs: &Resolved,
  types: &TypeRegistry,
) -> bool {
  // Type paths compare along the inheritance chain.
  if let (Resolved::Type(ty), Resolved::Value(Element::String(name))) =
    (lhs, rhs)
  {
    return match op {
      RelOp::Eq => types.is_subtype(ty, name),
      RelOp::Ne => !types.is_subtype(ty, name),
      _ => false,
    };
  }
  let (Resolved::Value(a), Resolved::Value(b)) = (lhs, rhs) else {
    return false;
  };
  match op {
    RelOp::Eq => a.loosely_equals(b),
    RelOp::Ne => !a.loosely_equals(b),
    RelOp::In => b.as_list().is_some_and(|l| {
      l.iter().any(|item| item.loosely_equals(a))
    }),
    RelOp::Lt | RelOp::Le | RelOp::Gt | RelOp::Ge => {
      match (a.as_float(), b.as_float()) {
        (Some(a), Some(b)) => match op {
          RelOp::Lt => a < b,
          RelOp::Le => a <= b,
          RelOp::Gt => a > b,
          RelOp::Ge => a >= b,
          _ => unreachable!(),
        },
        _ => false,
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Ident(String),
  Str(String),
  Int(i64),
  Float(f64),
  Dot,
  Comma,
  LParen,
  RParen,
  LBracket,
  RBracket,
  AndAnd,
  OrOr,
  Op(RelOp),
}

fn tokenize(src: &str) -> Result<Vec<Token>, FilterParseError> {
  let mut out = Vec::new();
  let mut chars = src.chars().peekable();
  while let Some(&c) = chars.peek() {
    match c {
      ' ' | '\t' | '\n' | '\r' => {
        chars.next();
      }
      '.' => {
        chars.next();
        out.push(Token::Dot);
      }
      ',' => {
        chars.next();
        out.push(Token::Comma);
      }
      '(' => {
        chars.next();
        out.push(Token::LParen);
      }
      ')' => {
        chars.next();
        out.push(Token::RParen);
      }
      '[' => {
        chars.next();
        out.push(Token::LBracket);
      }
      ']' => {
        chars.next();
        out.push(Token::RBracket);
      }
      '&' => {
        chars.next();
        if chars.next() != Some('&') {
          return Err(FilterParseError::Unexpected('&'));
        }
        out.push(Token::AndAnd);
      }
      '|' => {
        chars.next();
        if chars.next() != Some('|') {
          return Err(FilterParseError::Unexpected('|'));
        }
        out.push(Token::OrOr);
      }
      '=' => {
        chars.next();
        out.push(Token::Op(RelOp::Eq));
      }
      '!' => {
        chars.next();
        if chars.next() != Some('=') {
          return Err(FilterParseError::Unexpected('!'));
        }
        out.push(Token::Op(RelOp::Ne));
      }
      '<' => {
        chars.next();
        if chars.peek() == Some(&'=') {
          chars.next();
          out.push(Token::Op(RelOp::Le));
        } else {
          out.push(Token::Op(RelOp::Lt));
        }
      }
      '>' => {
        chars.next();
        if chars.peek() == Some(&'=') {
          chars.next();
          out.push(Token::Op(RelOp::Ge));
        } else {
          out.push(Token::Op(RelOp::Gt));
        }
      }
      '"' => {
        chars.next();
        let mut s = String::new();
        loop {
          match chars.next() {
            Some('"') => break,
            Some(c) => s.push(c),
            None => return Err(FilterParseError::UnterminatedString),
          }
        }
        out.push(Token::Str(s));
      }
      c if c.is_ascii_digit() || c == '-' => {
        let mut s = String::new();
        s.push(c);
        chars.next();
        while let Some(&c) = chars.peek() {
          if c.is_ascii_digit() || c == '.' {
            s.push(c);
            chars.next();
          } else {
            break;
          }
        }
        if s.contains('.') {
          let f =
            s.parse().map_err(|_| FilterParseError::BadNumber(s.clone()))?;
          out.push(Token::Float(f));
        } else {
          let i =
            s.parse().map_err(|_| FilterParseError::BadNumber(s.clone()))?;
          out.push(Token::Int(i));
        }
      }
      c if c.is_ascii_alphabetic() || c == '_' => {
        let mut s = String::new();
        while let Some(&c) = chars.peek() {
          if c.is_ascii_alphanumeric() || c == '_' {
            s.push(c);
            chars.next();
          } else {
            break;
          }
        }
        if s == "in" {
          out.push(Token::Op(RelOp::In));
        } else {
          out.push(Token::Ident(s));
        }
      }
      other => return Err(FilterParseError::Unexpected(other)),
    }
  }
  Ok(out)
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let t = self.tokens.get(self.pos).cloned();
    if t.is_some() {
      self.pos += 1;
    }
    t
  }

  fn expr(&mut self) -> Result<Expr, FilterParseError> {
    let first = self.and()?;
    let mut arms = vec![first];
    while self.peek() == Some(&Token::OrOr) {
      self.next();
      arms.push(self.and()?);
    }
    Ok(if arms.len() == 1 {
      arms.pop().unwrap()
    } else {
      Expr::Or(arms)
    })
  }

  fn and(&mut self) -> Result<Expr, FilterParseError> {
    let first = self.primary()?;
    let mut arms = vec![first];
    while self.peek() == Some(&Token::AndAnd) {
      self.next();
      arms.push(self.primary()?);
    }
    Ok(if arms.len() == 1 {
      arms.pop().unwrap()
    } else {
      Expr::And(arms)
    })
  }

  fn primary(&mut self) -> Result<Expr, FilterParseError> {
    if self.peek() == Some(&Token::LParen) {
      self.next();
      let inner = self.expr()?;
      if self.next() != Some(Token::RParen) {
        return Err(FilterParseError::ExpectedCloseParen);
      }
      return Ok(inner);
    }
    let lhs = self.operand()?;
    let op = match self.next() {
      Some(Token::Op(op)) => op,
      _ => return Err(FilterParseError::ExpectedOperator),
    };
    let rhs = self.operand()?;
    Ok(Expr::Cmp(lhs, op, rhs))
  }

  fn operand(&mut self) -> Result<Operand, FilterParseError> {
    match self.next() {
      Some(Token::Int(i)) => Ok(Operand::Literal(Element::Int(i))),
      Some(Token::Float(f)) => Ok(Operand::Literal(Element::Float(f))),
      Some(Token::Str(s)) => Ok(Operand::Literal(Element::String(s))),
      Some(Token::LBracket) => {
        let mut items = Vec::new();
        loop {
          match self.peek() {
            Some(Token::RBracket) => {
              self.next();
              break;
            }
            Some(_) => {
              match self.operand()? {
                Operand::Literal(e) => items.push(e),
                Operand::Path(..) => {
                  return Err(FilterParseError::PathInList)
                }
              }
              if self.peek() == Some(&Token::Comma) {
                self.next();
              }
            }
            None => return Err(FilterParseError::UnexpectedEnd),
          }
        }
        Ok(Operand::Literal(Element::List(items)))
      }
      Some(Token::Ident(subject)) => {
        let subject = match subject.as_str() {
          "target" => Subject::Target,
          "actor" => Subject::Actor,
          "tool" => Subject::Tool,
          other => {
            return Err(FilterParseError::UnknownSubject(other.to_owned()))
          }
        };
        if self.next() != Some(Token::Dot) {
          return Err(FilterParseError::ExpectedDot);
        }
        match self.next() {
          Some(Token::Ident(segment)) => {
            Ok(Operand::Path(subject, SmolStr::new(segment)))
          }
          _ => Err(FilterParseError::ExpectedProperty),
        }
      }
      _ => Err(FilterParseError::UnexpectedEnd),
    }
  }
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterParseError {
  #[error("unexpected character {0:?}")]
  Unexpected(char),
  #[error("unterminated string literal")]
  UnterminatedString,
  #[error("bad number {0:?}")]
  BadNumber(String),
  #[error("unexpected end of predicate")]
  UnexpectedEnd,
  #[error("expected a comparison operator")]
  ExpectedOperator,
  #[error("expected ')'")]
  ExpectedCloseParen,
  #[error("expected '.' after subject")]
  ExpectedDot,
  #[error("expected a property name")]
  ExpectedProperty,
  #[error("unknown subject {0:?}; expected target, actor or tool")]
  UnknownSubject(String),
  #[error("paths are not allowed inside list literals")]
  PathInList,
  #[error("trailing input after predicate")]
  TrailingInput,
  #[error("filter map has no `predicate` key")]
  MissingPredicate,
  #[error("filter value must be a string or map, not {0}")]
  BadValue(&'static str),
}
