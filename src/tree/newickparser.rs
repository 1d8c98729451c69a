use std::collections::BTreeMap;

use thiserror::Error;

use super::tree::{
    Tree,
    TreeNode
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NewickParseError {
    #[error("empty newick string")]
    Empty,

    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unexpected character '{found}' at position {position}")]
    UnexpectedCharacter { found: char, position: usize },

    #[error("invalid branch length '{text}' at position {position}")]
    InvalidBranchLength { text: String, position: usize },

    #[error("negative branch length {length} at position {position}")]
    NegativeBranchLength { length: f64, position: usize },

    #[error("unterminated comment starting at position {position}")]
    UnterminatedComment { position: usize },
}

/// 解析 Newick 字串，支援 BEAST 風格的 `[&key=value,...]` metadata，
/// 例如 `(t1[&state=0]:1.5,t2[&state=1]:0.5);`。
pub fn parse_newick(newick: &str) -> Result<Tree, NewickParseError> {
    let mut parser = NewickParser {
        chars: newick.chars().collect(),
        position: 0,
        nodes: Vec::new(),
    };
    parser.skip_whitespace();
    if parser.peek().is_none() {
        return Err(NewickParseError::Empty);
    }
    let root = parser.parse_subtree()?;
    parser.skip_whitespace();
    if parser.peek() == Some(';') {
        parser.position += 1;
        parser.skip_whitespace();
    }
    if let Some(found) = parser.peek() {
        return Err(NewickParseError::UnexpectedCharacter { found, position: parser.position });
    }
    Ok(Tree::from_nodes(parser.nodes, root))
}

struct NewickParser {
    chars: Vec<char>,
    position: usize,
    nodes: Vec<TreeNode>,
}

impl NewickParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn next(&mut self) -> Result<char, NewickParseError> {
        let c = self.peek().ok_or(NewickParseError::UnexpectedEnd)?;
        self.position += 1;
        Ok(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn parse_subtree(&mut self) -> Result<usize, NewickParseError> {
        self.skip_whitespace();
        let mut children = Vec::new();
        if self.peek() == Some('(') {
            self.position += 1;
            loop {
                children.push(self.parse_subtree()?);
                self.skip_whitespace();
                let position = self.position;
                match self.next()? {
                    ',' => continue,
                    ')' => break,
                    found => return Err(NewickParseError::UnexpectedCharacter { found, position }),
                }
            }
        }

        self.skip_whitespace();
        let label = self.parse_label()?;
        let mut metadata = BTreeMap::new();
        self.parse_comments(&mut metadata)?;

        let mut branch_length = 0.0;
        if self.peek() == Some(':') {
            self.position += 1;
            self.parse_comments(&mut metadata)?;
            branch_length = self.parse_branch_length()?;
            self.parse_comments(&mut metadata)?;
        }

        let index = self.nodes.len();
        self.nodes.push(TreeNode::new(label, branch_length, metadata));
        for child in children {
            Tree::add_child(&mut self.nodes, index, child);
        }
        Ok(index)
    }

    fn parse_label(&mut self) -> Result<Option<String>, NewickParseError> {
        if self.peek() == Some('\'') {
            let start = self.position;
            self.position += 1;
            let mut label = String::new();
            loop {
                match self.peek() {
                    Some('\'') => {
                        self.position += 1;
                        return Ok(Some(label));
                    }
                    Some(c) => {
                        label.push(c);
                        self.position += 1;
                    }
                    None => return Err(NewickParseError::UnterminatedComment { position: start }),
                }
            }
        }

        let mut label = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '(' | ')' | ',' | ':' | ';' | '[') || c.is_whitespace() {
                break;
            }
            label.push(c);
            self.position += 1;
        }
        Ok(if label.is_empty() { None } else { Some(label) })
    }

    fn parse_branch_length(&mut self) -> Result<f64, NewickParseError> {
        self.skip_whitespace();
        let start = self.position;
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E') {
                text.push(c);
                self.position += 1;
            } else {
                break;
            }
        }
        let length = text
            .parse::<f64>()
            .ok()
            .filter(|length| length.is_finite())
            .ok_or(NewickParseError::InvalidBranchLength { text, position: start })?;
        if length < 0.0 {
            return Err(NewickParseError::NegativeBranchLength { length, position: start });
        }
        Ok(length)
    }

    /// 讀取連續的 `[...]` 註解；以 `&` 開頭者解析成 key=value。
    fn parse_comments(&mut self, metadata: &mut BTreeMap<String, String>) -> Result<(), NewickParseError> {
        self.skip_whitespace();
        while self.peek() == Some('[') {
            let start = self.position;
            self.position += 1;
            let mut body = String::new();
            loop {
                match self.peek() {
                    Some(']') => {
                        self.position += 1;
                        break;
                    }
                    Some(c) => {
                        body.push(c);
                        self.position += 1;
                    }
                    None => return Err(NewickParseError::UnterminatedComment { position: start }),
                }
            }
            if let Some(entries) = body.strip_prefix('&') {
                for (key, value) in split_metadata(entries) {
                    metadata.insert(key, value);
                }
            }
            self.skip_whitespace();
        }
        Ok(())
    }
}

/// 以最外層的逗號切開 `key=value` 項目；`{...}` 內的逗號不切。
fn split_metadata(entries: &str) -> Vec<(String, String)> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in entries.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    items
        .into_iter()
        .filter_map(|item| {
            let (key, value) = item.split_once('=')?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.trim().to_owned(), value.to_owned()))
        })
        .collect()
}
