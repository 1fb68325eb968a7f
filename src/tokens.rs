//! Forward-only token stream over an XML export.
//!
//! The parser sees three kinds of token (start tag, char data, end tag) and
//! never seeks. Tokens already taken can be handed back with
//! [`Tokens::unread`]; they are replayed before the reader continues.
use std::collections::VecDeque;
use std::io::BufRead;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::parser::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Start(String),
    Text(String),
    End(String),
    Eof,
}

pub struct Tokens<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    replay: VecDeque<Token>,
    /// End tag owed for a self-closing element.
    owed_end: Option<String>,
}

impl<R: BufRead> Tokens<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.config_mut().trim_text(true);
        Self { reader, buf: Vec::with_capacity(4096), replay: VecDeque::new(), owed_end: None }
    }

    pub fn next(&mut self) -> Result<Token, ParseError> {
        match self.replay.pop_front() {
            Some(t) => Ok(t),
            None => self.read(),
        }
    }

    /// Put `tokens` back in front of the stream, in order.
    pub fn unread(&mut self, tokens: Vec<Token>) {
        for token in tokens.into_iter().rev() {
            self.replay.push_front(token);
        }
    }

    /// Skip the rest of an element whose start tag was already consumed.
    pub fn skip(&mut self) -> Result<(), ParseError> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Token::Start(_) => depth += 1,
                Token::End(_) => depth -= 1,
                Token::Text(_) => {}
                Token::Eof => return Err(ParseError::UnexpectedEof { inside: "skipped element".into() }),
            }
        }
        Ok(())
    }

    /// Char data up to the end tag of an element whose start tag was already
    /// consumed. Nested markup is skipped.
    pub fn text(&mut self) -> Result<String, ParseError> {
        let mut out = String::new();
        loop {
            match self.next()? {
                Token::Text(t) => out.push_str(&t),
                Token::Start(_) => self.skip()?,
                Token::End(_) => return Ok(out),
                Token::Eof => return Err(ParseError::UnexpectedEof { inside: "text element".into() }),
            }
        }
    }

    fn read(&mut self) -> Result<Token, ParseError> {
        if let Some(name) = self.owed_end.take() {
            return Ok(Token::End(name));
        }
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(e) => e,
                Err(source) => {
                    return Err(ParseError::Xml { position: self.reader.buffer_position() as u64, source });
                }
            };
            let token = match event {
                Event::Start(e) => Token::Start(lossy(e.local_name().as_ref())),
                Event::Empty(e) => {
                    let name = lossy(e.local_name().as_ref());
                    self.owed_end = Some(name.clone());
                    Token::Start(name)
                }
                Event::End(e) => Token::End(lossy(e.local_name().as_ref())),
                Event::Text(e) => match e.unescape() {
                    Ok(s) => Token::Text(s.into_owned()),
                    // legacy exports are not always valid UTF-8
                    Err(_) => Token::Text(lossy(&e)),
                },
                Event::CData(e) => Token::Text(lossy(&e)),
                Event::Eof => Token::Eof,
                // declarations, comments, processing instructions, doctype
                _ => continue,
            };
            return Ok(token);
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Tokens<&[u8]> {
        Tokens::new(src.as_bytes())
    }

    #[test]
    fn yields_start_text_end() {
        let mut t = tokens("<?xml version=\"1.0\"?><a><b>x &amp; y</b><c/></a>");
        assert_eq!(t.next().unwrap(), Token::Start("a".into()));
        assert_eq!(t.next().unwrap(), Token::Start("b".into()));
        assert_eq!(t.next().unwrap(), Token::Text("x & y".into()));
        assert_eq!(t.next().unwrap(), Token::End("b".into()));
        assert_eq!(t.next().unwrap(), Token::Start("c".into()));
        assert_eq!(t.next().unwrap(), Token::End("c".into()));
        assert_eq!(t.next().unwrap(), Token::End("a".into()));
        assert_eq!(t.next().unwrap(), Token::Eof);
    }

    #[test]
    fn unread_tokens_come_back_first() {
        let mut t = tokens("<a><x>1</x><id>4</id></a>");
        t.next().unwrap();
        let held = vec![t.next().unwrap(), t.next().unwrap(), t.next().unwrap()];
        assert_eq!(t.next().unwrap(), Token::Start("id".into()));
        assert_eq!(t.text().unwrap(), "4");

        t.unread(held);
        assert_eq!(t.next().unwrap(), Token::Start("x".into()));
        assert_eq!(t.text().unwrap(), "1");
        assert_eq!(t.next().unwrap(), Token::End("a".into()));
    }

    #[test]
    fn skip_consumes_whole_subtree() {
        let mut t = tokens("<a><junk><x>1</x><y/></junk><b>2</b></a>");
        t.next().unwrap();
        t.next().unwrap();
        t.skip().unwrap();
        assert_eq!(t.next().unwrap(), Token::Start("b".into()));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut t = tokens("<a><b>1</b>");
        t.next().unwrap();
        assert!(t.skip().is_err());
    }
}
