//! Stan program assembly and identifier scoping
//!
//! A generated program is a fixed sequence of Stan blocks, each built from
//! named [`Fragment`]s. Every fragment carries the program-level identifiers
//! it declares (`provides`) and reads (`requires`), which lets
//! [`GeneratedProgram::check_scoping`] verify that a configuration never
//! references an identifier it did not declare and never declares a data
//! input it does not use.

use crate::model_spec::ModelSpec;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Top-level Stan program blocks, in the order Stan requires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockKind {
    Functions,
    Data,
    TransformedData,
    Parameters,
    Model,
    GeneratedQuantities,
}

impl BlockKind {
    /// Keyword opening the block in Stan source.
    pub fn keyword(&self) -> &'static str {
        match self {
            BlockKind::Functions => "functions",
            BlockKind::Data => "data",
            BlockKind::TransformedData => "transformed data",
            BlockKind::Parameters => "parameters",
            BlockKind::Model => "model",
            BlockKind::GeneratedQuantities => "generated quantities",
        }
    }

    /// Whether declarations in this block are visible to later blocks.
    pub fn exports(&self) -> bool {
        !matches!(self, BlockKind::Model | BlockKind::GeneratedQuantities)
    }

    // Declaration-only blocks read better without blank lines between fragments.
    fn fragment_separator(&self) -> &'static str {
        match self {
            BlockKind::Data | BlockKind::Parameters => "\n",
            _ => "\n\n",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A named piece of Stan source with its identifier contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: &'static str,
    pub text: String,
    pub provides: Vec<&'static str>,
    pub requires: Vec<&'static str>,
}

impl Fragment {
    pub fn new(name: &'static str, text: impl Into<String>) -> Self {
        Self {
            name,
            text: text.into(),
            provides: Vec::new(),
            requires: Vec::new(),
        }
    }

    pub fn provides(mut self, idents: &[&'static str]) -> Self {
        self.provides.extend_from_slice(idents);
        self
    }

    pub fn requires(mut self, idents: &[&'static str]) -> Self {
        self.requires.extend_from_slice(idents);
        self
    }
}

/// One top-level block of a generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub fragments: Vec<Fragment>,
}

impl Block {
    pub fn new(kind: BlockKind, fragments: Vec<Fragment>) -> Self {
        Self { kind, fragments }
    }

    /// Whether any fragment of this block declares `ident`.
    pub fn declares(&self, ident: &str) -> bool {
        self.fragments.iter().any(|f| f.provides.contains(&ident))
    }

    /// Whether any fragment of this block reads `ident`.
    pub fn references(&self, ident: &str) -> bool {
        self.fragments.iter().any(|f| f.requires.contains(&ident))
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.name == name)
    }

    pub fn has_fragment(&self, name: &str) -> bool {
        self.fragment(name).is_some()
    }

    /// Block body without the surrounding braces.
    pub fn body(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.trim_matches('\n'))
            .collect::<Vec<_>>()
            .join(self.kind.fragment_separator())
    }

    pub fn render(&self) -> String {
        format!("{} {{\n{}\n}}\n", self.kind.keyword(), self.body())
    }
}

/// A single scoping problem found in a generated program.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeViolation {
    #[error("blocks out of order: {found} after {previous}")]
    BlockOrder {
        previous: BlockKind,
        found: BlockKind,
    },

    #[error("`{ident}` used in {block} fragment `{fragment}` before it is declared")]
    Undeclared {
        block: BlockKind,
        fragment: &'static str,
        ident: &'static str,
    },

    #[error("`{ident}` redeclared in {block} fragment `{fragment}`")]
    Redeclared {
        block: BlockKind,
        fragment: &'static str,
        ident: &'static str,
    },

    #[error("data input `{ident}` is never used")]
    UnusedData { ident: &'static str },

    #[error("{block} fragment `{fragment}` mentions `{ident}` without listing it")]
    Unlisted {
        block: BlockKind,
        fragment: &'static str,
        ident: String,
    },

    #[error("{block} fragment `{fragment}` lists `{ident}` but never mentions it")]
    Stale {
        block: BlockKind,
        fragment: &'static str,
        ident: &'static str,
    },
}

/// All scoping violations of one configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} scoping violation(s) for {}", .violations.len(), .spec)]
pub struct ScopeError {
    pub spec: ModelSpec,
    pub violations: Vec<ScopeViolation>,
}

/// A complete Stan program for one [`ModelSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedProgram {
    spec: ModelSpec,
    blocks: Vec<Block>,
}

impl GeneratedProgram {
    pub fn new(spec: ModelSpec, blocks: Vec<Block>) -> Self {
        Self { spec, blocks }
    }

    pub fn spec(&self) -> ModelSpec {
        self.spec
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, kind: BlockKind) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == kind)
    }

    /// Identifiers declared by the data block, in declaration order.
    pub fn data_inputs(&self) -> Vec<&'static str> {
        self.block(BlockKind::Data)
            .map(|b| b.fragments.iter().flat_map(|f| f.provides.iter().copied()).collect())
            .unwrap_or_default()
    }

    /// Identifiers declared by the parameters block, in declaration order.
    pub fn parameters(&self) -> Vec<&'static str> {
        self.block(BlockKind::Parameters)
            .map(|b| b.fragments.iter().flat_map(|f| f.provides.iter().copied()).collect())
            .unwrap_or_default()
    }

    /// Full Stan source.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(Block::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Check block order and declared-before-use, using the program's own
    /// declarations as the identifier universe for the text cross-check.
    pub fn check_scoping(&self) -> Result<(), ScopeError> {
        let universe: HashSet<&str> = self
            .blocks
            .iter()
            .flat_map(|b| b.fragments.iter())
            .flat_map(|f| f.provides.iter().copied())
            .collect();
        self.check_scoping_with(&universe)
    }

    /// Like [`check_scoping`](Self::check_scoping), but every identifier in
    /// `universe` found in a fragment's source must appear in its contract.
    /// Function definitions are self-contained and exempt from the text check.
    pub fn check_scoping_with(&self, universe: &HashSet<&str>) -> Result<(), ScopeError> {
        let mut violations = Vec::new();

        for pair in self.blocks.windows(2) {
            if pair[1].kind <= pair[0].kind {
                violations.push(ScopeViolation::BlockOrder {
                    previous: pair[0].kind,
                    found: pair[1].kind,
                });
            }
        }

        let mut global: HashSet<&'static str> = HashSet::new();
        let mut used: HashSet<&'static str> = HashSet::new();

        for block in &self.blocks {
            let mut local: HashSet<&'static str> = HashSet::new();

            for fragment in &block.fragments {
                for &ident in &fragment.provides {
                    if global.contains(ident) || local.contains(ident) {
                        violations.push(ScopeViolation::Redeclared {
                            block: block.kind,
                            fragment: fragment.name,
                            ident,
                        });
                    }
                }

                for &ident in &fragment.requires {
                    let visible = global.contains(ident)
                        || local.contains(ident)
                        || fragment.provides.contains(&ident);
                    if !visible {
                        violations.push(ScopeViolation::Undeclared {
                            block: block.kind,
                            fragment: fragment.name,
                            ident,
                        });
                    }
                    used.insert(ident);
                }

                if block.kind != BlockKind::Functions {
                    check_text(block.kind, fragment, universe, &mut violations);
                }

                local.extend(fragment.provides.iter().copied());
            }

            if block.kind.exports() {
                global.extend(local);
            }
        }

        for ident in self.data_inputs() {
            if !used.contains(ident) {
                violations.push(ScopeViolation::UnusedData { ident });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ScopeError {
                spec: self.spec,
                violations,
            })
        }
    }
}

fn check_text(
    block: BlockKind,
    fragment: &Fragment,
    universe: &HashSet<&str>,
    violations: &mut Vec<ScopeViolation>,
) {
    let mentioned = code_identifiers(&fragment.text);

    for &ident in &mentioned {
        let listed = fragment
            .provides
            .iter()
            .chain(&fragment.requires)
            .any(|&listed| listed == ident);
        if universe.contains(ident) && !listed {
            violations.push(ScopeViolation::Unlisted {
                block,
                fragment: fragment.name,
                ident: ident.to_string(),
            });
        }
    }

    for &ident in fragment.provides.iter().chain(&fragment.requires) {
        if !mentioned.contains(ident) {
            violations.push(ScopeViolation::Stale {
                block,
                fragment: fragment.name,
                ident,
            });
        }
    }
}

/// Identifier tokens of Stan source, with `//` comments removed. Numeric
/// literals such as `1e-3` do not contribute identifiers.
pub fn code_identifiers(source: &str) -> BTreeSet<&str> {
    let mut idents = BTreeSet::new();

    for line in source.lines() {
        let code = match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        };
        let bytes = code.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if c.is_ascii_alphabetic() || c == b'_' {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                idents.insert(&code[start..i]);
            } else if c.is_ascii_digit() {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
            } else {
                i += 1;
            }
        }
    }

    idents
}

/// Prefix every non-empty line with `levels` four-space indents.
pub fn indent(text: &str, levels: usize) -> String {
    let pad = "    ".repeat(levels);
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec::default()
    }

    #[test]
    fn test_code_identifiers_skips_comments_and_numbers() {
        let idents = code_identifiers("real x = 1e-3 * y; // uses z\nvector[N] w2;");
        let expected: BTreeSet<&str> = ["real", "x", "y", "vector", "N", "w2"].into_iter().collect();
        assert_eq!(idents, expected);
    }

    #[test]
    fn test_indent_leaves_blank_lines_empty() {
        assert_eq!(indent("a;\n\nb;", 2), "        a;\n\n        b;");
    }

    #[test]
    fn test_render_wraps_blocks() {
        let program = GeneratedProgram::new(
            spec(),
            vec![Block::new(
                BlockKind::Data,
                vec![
                    Fragment::new("n", "    int N;").provides(&["N"]),
                    Fragment::new("x", "    vector[N] x;").provides(&["x"]).requires(&["N"]),
                ],
            )],
        );
        assert_eq!(program.render(), "data {\n    int N;\n    vector[N] x;\n}\n");
    }

    #[test]
    fn test_undeclared_identifier_reported() {
        let program = GeneratedProgram::new(
            spec(),
            vec![
                Block::new(
                    BlockKind::Data,
                    vec![Fragment::new("n", "    int N;").provides(&["N"])],
                ),
                Block::new(
                    BlockKind::Parameters,
                    vec![Fragment::new("x", "    vector[N] x;")
                        .provides(&["x"])
                        .requires(&["N", "D"])],
                ),
            ],
        );
        let err = program.check_scoping().unwrap_err();
        assert!(err.violations.contains(&ScopeViolation::Undeclared {
            block: BlockKind::Parameters,
            fragment: "x",
            ident: "D",
        }));
    }

    #[test]
    fn test_unused_data_reported() {
        let program = GeneratedProgram::new(
            spec(),
            vec![Block::new(
                BlockKind::Data,
                vec![Fragment::new("n", "    int N;\n    int D;").provides(&["N", "D"])],
            )],
        );
        let err = program.check_scoping().unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err
            .violations
            .contains(&ScopeViolation::UnusedData { ident: "N" }));
    }

    #[test]
    fn test_model_locals_not_visible_later() {
        let program = GeneratedProgram::new(
            spec(),
            vec![
                Block::new(
                    BlockKind::Data,
                    vec![Fragment::new("n", "    int N;").provides(&["N"])],
                ),
                Block::new(
                    BlockKind::Model,
                    vec![Fragment::new("local", "    real a = N;")
                        .provides(&["a"])
                        .requires(&["N"])],
                ),
                Block::new(
                    BlockKind::GeneratedQuantities,
                    vec![Fragment::new("out", "    real b = a;")
                        .provides(&["b"])
                        .requires(&["a"])],
                ),
            ],
        );
        let err = program.check_scoping().unwrap_err();
        assert_eq!(
            err.violations,
            vec![ScopeViolation::Undeclared {
                block: BlockKind::GeneratedQuantities,
                fragment: "out",
                ident: "a",
            }]
        );
    }

    #[test]
    fn test_contract_cross_checked_against_text() {
        let program = GeneratedProgram::new(
            spec(),
            vec![
                Block::new(
                    BlockKind::Data,
                    vec![Fragment::new("n", "    int N;\n    int D;").provides(&["N", "D"])],
                ),
                Block::new(
                    BlockKind::Parameters,
                    // mentions D without listing it, lists N without using it
                    vec![Fragment::new("x", "    vector[D] x;")
                        .provides(&["x"])
                        .requires(&["N"])],
                ),
            ],
        );
        let err = program.check_scoping().unwrap_err();
        assert!(err.violations.iter().any(|v| matches!(
            v,
            ScopeViolation::Unlisted { ident, .. } if ident == "D"
        )));
        assert!(err.violations.contains(&ScopeViolation::Stale {
            block: BlockKind::Parameters,
            fragment: "x",
            ident: "N",
        }));
    }

    #[test]
    fn test_block_order_violation() {
        let program = GeneratedProgram::new(
            spec(),
            vec![
                Block::new(BlockKind::Model, Vec::new()),
                Block::new(BlockKind::Data, Vec::new()),
            ],
        );
        let err = program.check_scoping().unwrap_err();
        assert_eq!(
            err.violations,
            vec![ScopeViolation::BlockOrder {
                previous: BlockKind::Model,
                found: BlockKind::Data,
            }]
        );
    }
}
