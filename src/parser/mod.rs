//! Parser for value-type specs and tensor literals.
//!
//! ```text
//! type    := "error" | "double" | "tensor" ["<" cell ">"] "(" [dim {"," dim}] ")"
//! dim     := name ("{}" | "[" size "]")
//! literal := type [":" body]
//! body    := number                               (double)
//!          | "{" [cell {"," cell}] "}"             (verbose)
//!          | "[" nested numbers "]"                (dense, row-major)
//!          | "{" label ":" (number | dense) ... "}" (short form, one mapped dim)
//! cell    := "{" [dim ":" label {"," dim ":" label}] "}" ":" number
//! ```

use crate::ast::Span;
use crate::lexer::{LexError, Token, lex};
use crate::types::{CellType, Dimension, MAX_INDEXED_SIZE, ValueType};
use crate::value::{Label, TensorAddress, TensorSpec};

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            code: "TE-P001",
            position: 0,
            span: Span { start: e.position, end: e.position + e.snippet.len().max(1) },
            message: e.to_string(),
        }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

/// Parse a value-type spec such as `tensor<float>(x{},y[3])`.
pub fn parse_value_type(source: &str) -> Result<ValueType> {
    let mut parser = Parser::new(lex(source)?);
    let ty = parser.parse_type()?;
    parser.expect_end()?;
    Ok(ty)
}

/// Parse a tensor literal such as `tensor(x{}):{{x:a}:1}`.
pub fn parse_tensor_spec(source: &str) -> Result<TensorSpec> {
    let mut parser = Parser::new(lex(source)?);
    let spec = parser.parse_tensor()?;
    parser.expect_end()?;
    Ok(spec)
}

impl Parser {
    fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(Span::UNKNOWN)
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("TE-P002", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("TE-P003", format!("expected {:?}, got end of input", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("TE-P004", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("TE-P003", "expected identifier, got end of input".into())),
        }
    }

    fn expect_number(&mut self) -> Result<f64> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(n)
            }
            Some(Token::Ident(word)) => {
                let value = match word.as_str() {
                    "nan" | "NaN" => f64::NAN,
                    "inf" | "Infinity" => f64::INFINITY,
                    _ => return Err(self.error("TE-P005", format!("expected number, got '{}'", word))),
                };
                self.advance();
                Ok(value)
            }
            Some(tok) => Err(self.error("TE-P005", format!("expected number, got {:?}", tok))),
            None => Err(self.error("TE-P003", "expected number, got end of input".into())),
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(self.error("TE-P006", format!("unexpected trailing {:?}", tok))),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError { code, position: self.pos, span: self.peek_span(), message }
    }

    // ---- Types ----

    fn parse_type(&mut self) -> Result<ValueType> {
        let start = self.pos;
        let kind = self.expect_ident()?;
        match kind.as_str() {
            "error" => return Ok(ValueType::error_type()),
            "double" => return Ok(ValueType::double_type()),
            "tensor" => {}
            other => {
                self.pos = start;
                return Err(self.error("TE-P007", format!("unknown type '{}'", other)));
            }
        }
        let mut cell_type = CellType::Double;
        if self.eat(&Token::Less) {
            let name = self.expect_ident()?;
            cell_type = CellType::from_name(&name)
                .ok_or_else(|| self.error("TE-P008", format!("unknown cell type '{}'", name)))?;
            self.expect(&Token::Greater)?;
        }
        self.expect(&Token::LParen)?;
        let mut dims = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                dims.push(self.parse_dimension()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        let ty = ValueType::make_type(cell_type, dims);
        if ty.is_error() {
            return Err(self.error("TE-P009", "duplicate dimension or empty indexed dimension".into()));
        }
        if !ty.has_dimensions() && cell_type != CellType::Double {
            return Err(self.error("TE-P010", "a tensor without dimensions must use double cells".into()));
        }
        Ok(ty)
    }

    fn parse_dimension(&mut self) -> Result<Dimension> {
        let name = self.expect_ident()?;
        if self.eat(&Token::LBrace) {
            self.expect(&Token::RBrace)?;
            return Ok(Dimension::mapped(name));
        }
        self.expect(&Token::LBracket)?;
        let size = self.expect_number()?;
        if size.fract() != 0.0 || size < 1.0 || size > MAX_INDEXED_SIZE as f64 {
            return Err(self.error("TE-P011", format!("invalid size {} for dimension '{}'", size, name)));
        }
        self.expect(&Token::RBracket)?;
        Ok(Dimension::indexed(name, size as u32))
    }

    // ---- Tensor literals ----

    fn parse_tensor(&mut self) -> Result<TensorSpec> {
        let ty = self.parse_type()?;
        let mut spec = TensorSpec::new(ty.clone());
        if !self.eat(&Token::Colon) {
            return Ok(spec);
        }
        if ty.is_double() {
            spec.add(TensorAddress::new(), self.expect_number()?);
            return Ok(spec);
        }
        match self.peek() {
            Some(Token::LBracket) => {
                if ty.count_mapped_dimensions() > 0 {
                    return Err(self.error("TE-P012", "dense short form needs an indexed type".into()));
                }
                self.parse_dense_block(&ty, &TensorAddress::new(), &mut spec)?;
            }
            Some(Token::LBrace) if matches!(self.token_at(self.pos + 1), Some(Token::LBrace) | Some(Token::RBrace)) => {
                self.parse_verbose_cells(&ty, &mut spec)?;
            }
            Some(Token::LBrace) => self.parse_short_mapped(&ty, &mut spec)?,
            _ => return Err(self.error("TE-P013", "expected tensor cells".into())),
        }
        Ok(spec)
    }

    fn parse_verbose_cells(&mut self, ty: &ValueType, spec: &mut TensorSpec) -> Result<()> {
        self.expect(&Token::LBrace)?;
        if self.eat(&Token::RBrace) {
            return Ok(());
        }
        loop {
            let address = self.parse_address(ty)?;
            self.expect(&Token::Colon)?;
            let value = self.expect_number()?;
            spec.add(address, value);
            if self.eat(&Token::RBrace) {
                return Ok(());
            }
            self.expect(&Token::Comma)?;
        }
    }

    /// `{x:a,y:0}` checked against the type.
    fn parse_address(&mut self, ty: &ValueType) -> Result<TensorAddress> {
        self.expect(&Token::LBrace)?;
        let mut address = TensorAddress::new();
        if self.eat(&Token::RBrace) {
            return self.check_address(ty, address);
        }
        loop {
            let dim_name = self.expect_ident()?;
            self.expect(&Token::Colon)?;
            let dim = ty
                .dimension(&dim_name)
                .cloned()
                .ok_or_else(|| self.error("TE-P014", format!("unknown dimension '{}'", dim_name)))?;
            let label = self.parse_label(&dim)?;
            if address.insert(dim_name.clone(), label).is_some() {
                return Err(self.error("TE-P015", format!("dimension '{}' given twice", dim_name)));
            }
            if self.eat(&Token::RBrace) {
                return self.check_address(ty, address);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn check_address(&self, ty: &ValueType, address: TensorAddress) -> Result<TensorAddress> {
        if address.len() != ty.dimensions().len() {
            return Err(self.error("TE-P016", format!("address must name all {} dimensions", ty.dimensions().len())));
        }
        Ok(address)
    }

    fn parse_label(&mut self, dim: &Dimension) -> Result<Label> {
        let text = match self.peek().cloned() {
            Some(Token::Ident(s)) | Some(Token::Text(s)) => s,
            Some(Token::Number(n)) => {
                if dim.is_indexed() && (n.fract() != 0.0 || n < 0.0 || n >= dim.size as f64) {
                    return Err(self.error("TE-P017", format!("index {} out of range for '{}'", n, dim.name)));
                }
                self.advance();
                return Ok(if dim.is_indexed() { Label::Indexed(n as usize) } else { Label::Mapped(format_label(n)) });
            }
            Some(tok) => return Err(self.error("TE-P018", format!("expected label, got {:?}", tok))),
            None => return Err(self.error("TE-P003", "expected label, got end of input".into())),
        };
        if dim.is_indexed() {
            return Err(self.error("TE-P017", format!("dimension '{}' is indexed, got label '{}'", dim.name, text)));
        }
        self.advance();
        Ok(Label::Mapped(text))
    }

    /// Nested `[...]` blocks over the indexed dimensions, last dimension innermost.
    fn parse_dense_block(&mut self, ty: &ValueType, prefix: &TensorAddress, spec: &mut TensorSpec) -> Result<()> {
        let indexed: Vec<Dimension> = ty.indexed_dimensions().into_iter().cloned().collect();
        let mut values = Vec::new();
        self.parse_nested_numbers(&mut values)?;
        let expected: usize = indexed.iter().map(|d| d.size as usize).product();
        if values.len() != expected {
            return Err(self.error("TE-P019", format!("expected {} dense cells, got {}", expected, values.len())));
        }
        let mut value_iter = values.into_iter();
        let dims: Vec<(String, usize)> = indexed.iter().map(|d| (d.name.clone(), d.size as usize)).collect();
        crate::value::spec::for_each_dense_address(&dims, |dense| {
            let mut address = prefix.clone();
            address.extend(dense.iter().map(|(d, i)| (d.clone(), Label::Indexed(*i))));
            if let Some(v) = value_iter.next() {
                spec.add(address, v);
            }
        });
        Ok(())
    }

    fn parse_nested_numbers(&mut self, out: &mut Vec<f64>) -> Result<()> {
        self.expect(&Token::LBracket)?;
        if self.eat(&Token::RBracket) {
            return Ok(());
        }
        loop {
            if self.peek() == Some(&Token::LBracket) {
                self.parse_nested_numbers(out)?;
            } else {
                out.push(self.expect_number()?);
            }
            if self.eat(&Token::RBracket) {
                return Ok(());
            }
            self.expect(&Token::Comma)?;
        }
    }

    /// `{a:1,b:2}` for one mapped dimension, or `{a:[1,2]}` when it is mixed.
    fn parse_short_mapped(&mut self, ty: &ValueType, spec: &mut TensorSpec) -> Result<()> {
        let mapped = ty.mapped_dimensions();
        if mapped.len() != 1 {
            return Err(self.error("TE-P020", "short form needs exactly one mapped dimension".into()));
        }
        let dim = mapped[0].clone();
        self.expect(&Token::LBrace)?;
        if self.eat(&Token::RBrace) {
            return Ok(());
        }
        loop {
            let label = self.parse_label(&dim)?;
            self.expect(&Token::Colon)?;
            let mut prefix = TensorAddress::new();
            prefix.insert(dim.name.clone(), label);
            if ty.count_indexed_dimensions() > 0 {
                self.parse_dense_block(ty, &prefix, spec)?;
            } else {
                let value = self.expect_number()?;
                spec.add(prefix, value);
            }
            if self.eat(&Token::RBrace) {
                return Ok(());
            }
            self.expect(&Token::Comma)?;
        }
    }
}

/// Integer-valued numbers render without a fraction so `{k:3}` and `{k:3.0}` agree.
fn format_label(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 { format!("{}", n as i64) } else { format!("{}", n) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_types() {
        assert_eq!(parse_value_type("double").unwrap(), ValueType::double_type());
        assert!(parse_value_type("error").unwrap().is_error());
        let ty = parse_value_type("tensor<bfloat16>(y[2], x{})").unwrap();
        assert_eq!(ty.to_spec(), "tensor<bfloat16>(x{},y[2])");
        assert_eq!(parse_value_type("tensor()").unwrap(), ValueType::double_type());
    }

    #[test]
    fn reject_bad_types() {
        assert_eq!(parse_value_type("tensor(x[0])").unwrap_err().code, "TE-P011");
        assert_eq!(parse_value_type("tensor(x[2],x{})").unwrap_err().code, "TE-P009");
        assert_eq!(parse_value_type("tensor<half>(x[2])").unwrap_err().code, "TE-P008");
        assert_eq!(parse_value_type("tensor<float>()").unwrap_err().code, "TE-P010");
        assert_eq!(parse_value_type("matrix(x[2])").unwrap_err().code, "TE-P007");
        assert_eq!(parse_value_type("tensor(x[2]) y").unwrap_err().code, "TE-P006");
    }

    #[test]
    fn size_of_mapped_marker_is_rejected() {
        assert_eq!(parse_value_type("tensor(x[4294967295])").unwrap_err().code, "TE-P011");
        let largest = parse_value_type("tensor(x[4294967294])").unwrap();
        assert!(largest.dimensions()[0].is_indexed());
        assert!(ValueType::from_spec("tensor(x[4294967295])").is_error());
    }

    #[test]
    fn parse_verbose_literal() {
        let spec = parse_tensor_spec("tensor(x{},y[2]):{{x:a,y:1}:2.5,{x:\"b c\",y:0}:-1}").unwrap();
        assert_eq!(spec.cells().len(), 2);
        assert_eq!(spec.as_double(), 1.5);
    }

    #[test]
    fn parse_dense_literal() {
        let spec = parse_tensor_spec("tensor(x[2],y[3]):[[1,2,3],[4,5,6]]").unwrap();
        let mut address = TensorAddress::new();
        address.insert("x".into(), Label::Indexed(1));
        address.insert("y".into(), Label::Indexed(0));
        assert_eq!(spec.cells()[&address], 4.0);
        assert!(parse_tensor_spec("tensor(x[2]):[1,2,3]").is_err());
    }

    #[test]
    fn parse_short_forms() {
        let sparse = parse_tensor_spec("tensor(k{}):{a:1,b:2}").unwrap();
        assert_eq!(sparse.as_double(), 3.0);
        let mixed = parse_tensor_spec("tensor(k{},x[2]):{a:[1,2],7:[3,4]}").unwrap();
        assert_eq!(mixed.cells().len(), 4);
        assert!(mixed.cells().keys().any(|a| a["k"] == Label::Mapped("7".into())));
    }

    #[test]
    fn parse_double_and_empty() {
        assert_eq!(parse_tensor_spec("double:3.5").unwrap().as_double(), 3.5);
        assert!(parse_tensor_spec("tensor(k{}):{}").unwrap().cells().is_empty());
    }

    #[test]
    fn index_out_of_range() {
        assert_eq!(parse_tensor_spec("tensor(x[2]):{{x:2}:1}").unwrap_err().code, "TE-P017");
    }
}
