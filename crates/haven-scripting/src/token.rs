/// Lexical tokens with their source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals & names
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    Not,
    And,
    Or,
    True,
    False,
    NoneLit,
    Break,
    Continue,
    Pass,

    // Operators & punctuation
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Assign,
    PlusAssign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl TokenKind {
    /// Human label used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Int(n) => format!("integer {n}"),
            TokenKind::Float(f) => format!("float {f}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::Eof => "end of script".to_string(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}
