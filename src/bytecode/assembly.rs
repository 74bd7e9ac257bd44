/*!
  The human readable textual form of module code is called assembly. It is the listing format of
  the Erlang compiler: a sequence of Erlang terms, each terminated by a period.

  ```text
  {module, demo}.
  {exports, [{double,1}]}.

  {function, double, 1, 2}.
    {label,1}.
      {func_info,{atom,demo},{atom,double},1}.
    {label,2}.
      {gc_bif2,{f,0},1,{extfunc,erlang,'+',2},{x,0},{x,0},{x,0}}.
      return.
  ```

  A form `{function, Name, Arity, Entry}` starts a function; every instruction up to the next
  such form belongs to it. An instruction is an atom (no operands) or a tuple whose first element
  names the operation. The names are those of `Operation`, so `Operation::from_str` looks them up.
  Forms `attributes` and `labels` are accepted and ignored. `%` starts a comment.

  Operands use the compiler's tagged notation: `{x,N}`, `{y,N}`, `{fr,N}`, `{f,Label}`,
  `{integer,N}`, `{atom,A}`, `{float,X}`, `nil`, `{literal,Term}`, `{string,Bytes}`,
  `{extfunc,M,F,A}` and `{list,[...]}`. Bare integers and atoms are immediates.

  The operand count of each operation is the one listed on `Operation`. Where the compiler emits
  an extra operand this reader does not drop it, so a listing produced by a different compiler
  release may need adjusting.
*/

use std::convert::TryFrom;
use std::str::FromStr;

use nom::{
  branch::alt,
  bytes::complete::{tag, take_while, take_while1},
  character::complete::{char as one_char, digit1, multispace1, one_of},
  combinator::{map, map_res, opt, recognize},
  error::{ErrorKind, ParseError},
  multi::{many0, separated_list},
  sequence::{delimited, pair, preceded, terminated, tuple},
  Err as NomErr,
  IResult
};

use crate::bits::{FLAG_LITTLE, FLAG_NATIVE, FLAG_SIGNED};
use crate::error::AssemblyError;
use crate::functor::{Atom, ArityType, FunId};
use crate::module::Module;
use crate::operand::Operand;
use crate::term::Term;

use super::{Encoder, Instruction, Operation};

/// One function of a listing.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionListing {
  pub name  : Atom,
  pub arity : ArityType,
  pub entry : u32,
  pub body  : Vec<Instruction>,
}

/// A parsed listing, before encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct Listing {
  pub module    : Atom,
  pub exports   : Vec<(Atom, ArityType)>,
  pub functions : Vec<FunctionListing>,
}

impl Listing {
  /// Encodes the listing into a module.
  pub fn encode(&self) -> Result<Module, AssemblyError> {
    let mut encoder = Encoder::new(&self.module);
    for function in &self.functions {
      encoder.function(&function.name, function.arity, function.entry, &function.body)?;
    }
    for (name, arity) in &self.exports {
      encoder.export(name, *arity);
    }
    Ok(encoder.finish()?)
  }
}

/// Parses and encodes a listing.
pub fn assemble(text: &str) -> Result<Module, AssemblyError> {
  parse_listing(text)?.encode()
}

pub fn parse_listing(text: &str) -> Result<Listing, AssemblyError> {
  let mut module: Option<Atom> = None;
  let mut exports   = vec![];
  let mut functions: Vec<FunctionListing> = vec![];

  for (line, form) in parse_forms(text)? {
    match attribute(&form) {
      Some(("module", [Term::Atom(name)])) => module = Some(name.clone()),

      Some(("exports", [list])) => {
        let pairs = list.list_to_vec().ok_or_else(|| bad_form(line, &form))?;
        for export in pairs {
          match export.as_tuple() {
            Some([Term::Atom(name), Term::Integer(arity)]) => {
              let arity = ArityType::try_from(*arity).map_err(|_| bad_form(line, &form))?;
              exports.push((name.clone(), arity));
            }
            _ => return Err(bad_form(line, &form))
          }
        }
      }

      Some(("attributes", _)) | Some(("labels", _)) => {}

      Some(("function", [Term::Atom(name), Term::Integer(arity), Term::Integer(entry)])) => {
        functions.push(FunctionListing {
          name  : name.clone(),
          arity : ArityType::try_from(*arity).map_err(|_| bad_form(line, &form))?,
          entry : u32::try_from(*entry).map_err(|_| bad_form(line, &form))?,
          body  : vec![]
        });
      }

      _ => {
        let instruction = instruction(line, &form)?;
        match functions.last_mut() {
          Some(function) => function.body.push(instruction),
          None           => return Err(AssemblyError::OutsideFunction(line))
        }
      }
    }
  }

  Ok(Listing {
    module: module.ok_or(AssemblyError::MissingModule)?,
    exports,
    functions
  })
}

/// Parses a single Erlang term.
pub fn parse_term(text: &str) -> Result<Term, AssemblyError> {
  match terminated(pterm, pskip)(text) {
    Ok(("", term)) => Ok(term),
    Ok((rest, _))  => Err(syntax_error(text, rest, "unexpected text after term")),
    Err(NomErr::Error((rest, kind))) | Err(NomErr::Failure((rest, kind))) => {
      Err(syntax_error(text, rest, kind.description()))
    }
    Err(NomErr::Incomplete(_)) => Err(syntax_error(text, "", "input incomplete")),
  }
}

// region Forms

/// Every form of the listing with the line it starts on.
fn parse_forms(text: &str) -> Result<Vec<(usize, Term)>, AssemblyError> {
  let mut forms = vec![];
  let mut rest = skip(text);
  while !rest.is_empty() {
    let line = line_of(text, rest);
    match terminated(pterm, wst(one_char('.')))(rest) {
      Ok((next, form)) => {
        forms.push((line, form));
        rest = skip(next);
      }
      Err(NomErr::Error((at, kind))) | Err(NomErr::Failure((at, kind))) => {
        return Err(syntax_error(text, at, kind.description()));
      }
      Err(NomErr::Incomplete(_)) => return Err(syntax_error(text, rest, "input incomplete")),
    }
  }
  Ok(forms)
}

fn skip(text: &str) -> &str {
  match pskip::<(&str, ErrorKind)>(text) {
    Ok((rest, _)) => rest,
    Err(_)        => text
  }
}

fn line_of(text: &str, rest: &str) -> usize {
  let consumed = text.len() - rest.len();
  1 + text[..consumed].matches('\n').count()
}

fn syntax_error(text: &str, rest: &str, message: &str) -> AssemblyError {
  AssemblyError::Syntax {
    line    : line_of(text, rest),
    message : message.to_string()
  }
}

fn bad_form(line: usize, form: &Term) -> AssemblyError {
  AssemblyError::BadForm { line, form: form.to_string() }
}

/// A module attribute `{Name, Values...}`, recognized by name only.
fn attribute(form: &Term) -> Option<(&str, &[Term])> {
  match form.as_tuple()? {
    [Term::Atom(name), values @ ..] => match &**name {
      "module" | "exports" | "attributes" | "labels" | "function" => Some((&**name, values)),
      _                                                           => None
    },
    _ => None
  }
}

fn instruction(line: usize, form: &Term) -> Result<Instruction, AssemblyError> {
  let (name, args): (&Atom, &[Term]) = match form {
    Term::Atom(name) => (name, &[]),
    Term::Tuple(elements) => match elements.split_first() {
      Some((Term::Atom(name), args)) => (name, args),
      _                              => return Err(bad_form(line, form))
    },
    _ => return Err(bad_form(line, form))
  };

  let operation = Operation::from_str(name)
    .map_err(|_| AssemblyError::UnknownOperation { line, name: name.to_string() })?;
  if operation.arity() != args.len() {
    return Err(AssemblyError::WrongArity {
      line,
      operation,
      expected : operation.arity(),
      found    : args.len()
    });
  }
  Ok(Instruction::new(operation, args.iter().map(operand).collect()))
}

/// Converts a term in the compiler's tagged notation to an operand.
fn operand(term: &Term) -> Operand {
  let slot = |t: &Term| t.as_integer().and_then(|n| u16::try_from(n).ok());
  match term {
    Term::Integer(i)                    => Operand::Int(*i),
    Term::Atom(a) if &**a == "nil"      => Operand::Nil,
    Term::Atom(a)                       => Operand::Atom(a.clone()),
    Term::Nil                           => Operand::Nil,
    Term::Tuple(elements)               => {
      let tagged = match elements.split_first() {
        Some((Term::Atom(tag), rest)) => Some((&**tag, rest)),
        _                             => None
      };
      match tagged {
        Some(("x", [n]))  if slot(n).is_some() => Operand::X(slot(n).unwrap_or(0)),
        Some(("y", [n]))  if slot(n).is_some() => Operand::Y(slot(n).unwrap_or(0)),
        Some(("fr", [n])) if slot(n).is_some() => Operand::Fr(slot(n).unwrap_or(0)),
        Some(("f", [Term::Integer(n)])) if *n >= 0 => Operand::Label(*n as u32),
        Some(("integer", [Term::Integer(n)]))  => Operand::Int(*n),
        Some(("atom", [Term::Atom(a)]))        => Operand::Atom(a.clone()),
        Some(("float", [x])) if x.is_number()  => Operand::Literal(Term::Float(x.as_float().unwrap_or_default())),
        Some(("literal", [t]))                 => Operand::Literal(t.clone()),
        Some(("string", [s]))                  => match bytes(s) {
          Some(bytes) => Operand::Literal(Term::binary(&bytes)),
          None        => Operand::Literal(term.clone())
        },
        Some(("extfunc", [Term::Atom(m), Term::Atom(f), Term::Integer(a)])) if *a >= 0 => {
          Operand::Extfunc(FunId::new(m, f, *a as ArityType))
        }
        Some(("list", [items])) => match items.list_to_vec() {
          Some(items) => Operand::List(items.iter().map(operand).collect()),
          None        => Operand::Literal(term.clone())
        },
        Some(("field_flags", [flags])) => match field_flags(flags) {
          Some(flags) => Operand::Int(flags as i64),
          None        => Operand::Literal(term.clone())
        },
        // A typed register: {tr, Register, Type}.
        Some(("tr", [register, _])) => operand(register),
        _ => Operand::Literal(term.clone())
      }
    }
    other => Operand::Literal(other.clone())
  }
}

/// Segment flags, given as their numeric value or as a list of names such as `[little,signed]`.
fn field_flags(flags: &Term) -> Option<u16> {
  if let Some(n) = flags.as_integer() {
    return u16::try_from(n).ok();
  }
  flags.list_to_vec()?.iter().try_fold(0, |acc, flag| {
    let bit = match flag.as_atom().map(|a| &**a) {
      Some("little")   => FLAG_LITTLE,
      Some("signed")   => FLAG_SIGNED,
      Some("native")   => FLAG_NATIVE,
      Some("big")
      | Some("unsigned")
      | Some("aligned") => 0,
      _                 => return None
    };
    Some(acc | bit)
  })
}

/// The bytes of a string operand, given as a binary or as a list of byte values.
fn bytes(term: &Term) -> Option<Vec<u8>> {
  match term {
    Term::Binary(bits) if bits.is_binary() => Some(bits.to_bytes()),
    other => other.list_to_vec()?
                  .iter()
                  .map(|b| b.as_integer().and_then(|b| u8::try_from(b).ok()))
                  .collect()
  }
}

// endregion

// region Term grammar

/**
  <term> ::= <tuple> | <list> | <binary> | <string> | <float> | <integer> | <atom>
*/
fn pterm(text: &str) -> IResult<&str, Term> {
  ws(alt((
    ptuple, plist, pbinary, pstring, pfloat, pinteger, patom
  )))
  (text)
}

/// <tuple> ::= '{' (<term> (',' <term>)*)? '}'
fn ptuple(text: &str) -> IResult<&str, Term> {
  map(
    delimited(
      wst(one_char('{')),
      separated_list(one_char(','), pterm),
      one_char('}')
    ),
    Term::tuple
  )(text)
}

/// <list> ::= '[' (<term> (',' <term>)* ('|' <term>)?)? ']'
fn plist(text: &str) -> IResult<&str, Term> {
  let (text, _)     = wst(one_char('['))(text)?;
  let (text, items) = separated_list(one_char(','), pterm)(text)?;
  let (text, tail)  = opt(preceded(one_char('|'), pterm))(text)?;
  let (text, _)     = one_char(']')(text)?;
  let list = items.into_iter()
                  .rev()
                  .fold(tail.unwrap_or(Term::Nil), |tail, head| Term::cons(head, tail));
  Ok((text, list))
}

/// <binary> ::= '<<' (<segment> (',' <segment>)*)? '>>'
/// <segment> ::= <string> | <integer>
fn pbinary(text: &str) -> IResult<&str, Term> {
  let segment = ws(alt((
    map(|i| pquoted('"', i), String::into_bytes),
    map_res(digit1, |digits: &str| digits.parse::<u8>().map(|b| vec![b]))
  )));
  map(
    delimited(
      wst(tag("<<")),
      separated_list(one_char(','), segment),
      tag(">>")
    ),
    |segments: Vec<Vec<u8>>| Term::binary(&segments.concat())
  )(text)
}

/// A string is a list of character codes.
fn pstring(text: &str) -> IResult<&str, Term> {
  map(
    |i| pquoted('"', i),
    |s: String| Term::list(s.chars().map(|c| Term::Integer(c as i64)).collect())
  )(text)
}

/// <float> ::= '-'? <digits> '.' <digits> (('e' | 'E') ('+' | '-')? <digits>)?
fn pfloat(text: &str) -> IResult<&str, Term> {
  map_res(
    recognize(tuple((
      opt(one_char('-')),
      digit1,
      one_char('.'),
      digit1,
      opt(tuple((one_of("eE"), opt(one_of("+-")), digit1)))
    ))),
    |digits: &str| digits.parse::<f64>().map(Term::Float)
  )(text)
}

/// <integer> ::= '-'? <digits>
fn pinteger(text: &str) -> IResult<&str, Term> {
  map_res(
    recognize(pair(opt(one_char('-')), digit1)),
    |digits: &str| digits.parse::<i64>().map(Term::Integer)
  )(text)
}

/// <atom> ::= <lowercase> (<alphanumeric> | '_' | '@')* | '\'' <quoted> '\''
fn patom(text: &str) -> IResult<&str, Term> {
  alt((
    map(
      recognize(pair(
        take_while1(|c: char| c.is_ascii_lowercase()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '@')
      )),
      Term::atom
    ),
    map(|i| pquoted('\'', i), |name: String| Term::atom(&name))
  ))(text)
}

/// Text between `quote` characters. A backslash escapes the next character.
fn pquoted(quote: char, text: &str) -> IResult<&str, String> {
  let (mut rest, _) = one_char(quote)(text)?;
  let mut value = String::new();
  loop {
    let mut chars = rest.chars();
    match chars.next() {
      Some(c) if c == quote => return Ok((chars.as_str(), value)),
      Some('\\') => match chars.next() {
        Some('n') => value.push('\n'),
        Some('t') => value.push('\t'),
        Some(c)   => value.push(c),
        None      => return Err(NomErr::Error((rest, ErrorKind::Escaped)))
      },
      Some(c) => value.push(c),
      None    => return Err(NomErr::Error((rest, ErrorKind::Char)))
    }
    rest = chars.as_str();
  }
}

fn ws<'a, F: 'a, O, E: ParseError<&'a str>>(inner: F) -> impl Fn(&'a str) -> IResult<&'a str, O, E>
  where
  F: Fn(&'a str) -> IResult<&'a str, O, E>,
{
  move |i| {
    delimited(
      &pskip,
      &inner,
      &pskip
    )(i)
  }
}

fn wst<'a, F: 'a, O, E: ParseError<&'a str>>(inner: F) -> impl Fn(&'a str) -> IResult<&'a str, O, E>
  where
  F: Fn(&'a str) -> IResult<&'a str, O, E>,
{
  move |i| {
    terminated(
      &inner,
      &pskip
    )(i)
  }
}

/// Whitespace and comments.
fn pskip<'a, E: ParseError<&'a str>>(i: &'a str) -> IResult<&'a str, (), E> {
  map(
    many0(alt((map(multispace1, |_| ()), peol_comment))),
    |_| ()
  )(i)
}

/// <eol_comment> ::= '%' [^\n\r]*
fn peol_comment<'a, E: ParseError<&'a str>>(i: &'a str) -> IResult<&'a str, (), E> {
  map(
    pair(one_char('%'), take_while(|c: char| c != '\n' && c != '\r')),
    |_| ()
  )(i)
}

// endregion


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terms() {
    let term = parse_term("{ok, [1, -2.5e1 | tail], 'Quoted atom', \"hi\", <<\"ab\", 3>>, []}").unwrap();
    assert_eq!(term.to_string(), "{ok,[1,-25.0|tail],'Quoted atom',[104,105],<<97,98,3>>,[]}");
    assert!(parse_term("{unclosed").is_err());
    assert!(parse_term("ok extra").is_err());
  }

  #[test]
  fn operands() {
    let operands: Vec<Operand> = [
      "{x,3}", "{y,0}", "{fr,1}", "{f,7}", "{integer,-4}", "{atom,ok}", "nil", "5",
      "{extfunc,erlang,'+',2}", "{string,\"ab\"}", "{float,1.5}",
      "{field_flags,[little,signed]}"
    ].iter()
     .map(|text| operand(&parse_term(text).unwrap()))
     .collect();
    assert_eq!(operands, vec![
      Operand::X(3),
      Operand::Y(0),
      Operand::Fr(1),
      Operand::Label(7),
      Operand::Int(-4),
      Operand::atom("ok"),
      Operand::Nil,
      Operand::Int(5),
      Operand::extfunc("erlang", "+", 2),
      Operand::Literal(Term::binary(b"ab")),
      Operand::Literal(Term::Float(1.5)),
      Operand::Int(6),
    ]);
  }

  const LISTING: &str = "
    {module, demo}.  %% a comment
    {exports, [{id,1}]}.
    {attributes, []}.
    {labels, 3}.

    {function, id, 1, 2}.
      {label,1}.
        {func_info,{atom,demo},{atom,id},1}.
      {label,2}.
        {move,{x,0},{x,1}}.
        {move,{x,1},{x,0}}.
        return.
  ";

  #[test]
  fn listing() {
    let listing = parse_listing(LISTING).unwrap();
    assert_eq!(listing.module, Atom::from("demo"));
    assert_eq!(listing.exports, vec![(Atom::from("id"), 1)]);
    assert_eq!(listing.functions.len(), 1);
    let function = &listing.functions[0];
    assert_eq!((function.arity, function.entry), (1, 2));
    assert_eq!(function.body.len(), 6);
    assert_eq!(function.body[5], Instruction::new(Operation::Return, vec![]));

    let module = listing.encode().unwrap();
    assert_eq!(module.export_entry(&Atom::from("id"), 1), Some(4));
  }

  #[test]
  fn errors_carry_line_numbers() {
    let unknown = "{module, m}.\n{function, f, 0, 2}.\n{frobnicate, 1}.";
    assert_eq!(
      parse_listing(unknown),
      Err(AssemblyError::UnknownOperation { line: 3, name: "frobnicate".to_string() })
    );

    let arity = "{module, m}.\n{function, f, 0, 2}.\n\n{move,{x,0}}.";
    assert_eq!(
      parse_listing(arity),
      Err(AssemblyError::WrongArity { line: 4, operation: Operation::Move, expected: 2, found: 1 })
    );

    let negative_arity = "{module, m}.\n{function, f, -1, 2}.";
    assert_eq!(
      parse_listing(negative_arity),
      Err(AssemblyError::BadForm { line: 2, form: "{function,f,-1,2}".to_string() })
    );
    match parse_listing("{module, m}.\n{exports, [{f,-3}]}.") {
      Err(AssemblyError::BadForm { line: 2, .. }) => {}
      other => panic!("unexpected result {:?}", other),
    }
    match parse_listing("{module, m}.\n{function, f, 0, -2}.") {
      Err(AssemblyError::BadForm { line: 2, .. }) => {}
      other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(parse_listing("return."), Err(AssemblyError::OutsideFunction(1)));
    assert_eq!(parse_listing("{labels, 1}."), Err(AssemblyError::MissingModule));
    match parse_listing("{module, m}.\n{function, f") {
      Err(AssemblyError::Syntax { line: 2, .. }) => {}
      other => panic!("unexpected result {:?}", other),
    }
  }
}
