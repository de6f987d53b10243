// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// A single configuration token with the line it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Word(String),
    Open,
    Close,
}

impl TokenKind {
    pub fn describe(&self) -> &str {
        match self {
            TokenKind::Word(word) => word,
            TokenKind::Open => "{",
            TokenKind::Close => "}",
        }
    }
}

/// Splits configuration text into tokens: whitespace-separated words with
/// `{` and `}` as single-character tokens. A word starting with `#` begins a
/// comment running to the end of the line.
pub(crate) fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (line_index, line) in text.lines().enumerate() {
        let line_number = line_index as u32 + 1;
        'words: for word in line.split_whitespace() {
            if word.starts_with('#') {
                break 'words;
            }
            let mut current = String::new();
            for c in word.chars() {
                if c == '{' || c == '}' {
                    if !current.is_empty() {
                        tokens.push(Token {
                            kind: TokenKind::Word(std::mem::take(&mut current)),
                            line: line_number,
                        });
                    }
                    tokens.push(Token {
                        kind: if c == '{' {
                            TokenKind::Open
                        } else {
                            TokenKind::Close
                        },
                        line: line_number,
                    });
                } else {
                    current.push(c);
                }
            }
            if !current.is_empty() {
                tokens.push(Token {
                    kind: TokenKind::Word(current),
                    line: line_number,
                });
            }
        }
    }
    tokens
}
