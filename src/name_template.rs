//! Source name templates.
//!
//! A source file or dataset name may contain `%b`, which expands to the
//! decimal block index of a printf mapping, and `%%` for a literal percent
//! sign. Any other `%` escape is rejected.

use crate::error::{Result, VdsError};
use crate::utils::digits10;
use std::fmt;
use std::sync::Arc;

/// A parsed source name.
///
/// The original string is kept behind an [`Arc`] so mappings naming the
/// same source can share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    template: Arc<str>,
    /// Literal pieces between substitutions; `nsubs + 1` of them. `None`
    /// when the template has no escapes at all.
    segments: Option<Vec<String>>,
    static_strlen: usize,
    nsubs: usize,
}

impl NameTemplate {
    pub fn new(template: &str) -> Result<Self> {
        parse_template(Arc::from(template))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The shared string storage behind this name.
    pub fn shared(&self) -> &Arc<str> {
        &self.template
    }

    /// Number of literal bytes in the expanded name.
    pub fn static_strlen(&self) -> usize {
        self.static_strlen
    }

    /// Number of `%b` substitutions.
    pub fn nsubs(&self) -> usize {
        self.nsubs
    }

    pub fn is_printf(&self) -> bool {
        self.nsubs > 0
    }

    /// Expand the template for block `block`.
    pub fn build(&self, block: u64) -> Result<String> {
        let Some(segments) = &self.segments else {
            return Ok(self.template.to_string());
        };
        if self.nsubs == 0 {
            return Ok(segments.concat());
        }

        let digits = block.to_string();
        let mut name = String::new();
        name.try_reserve_exact(self.static_strlen + self.nsubs * digits10(block))?;
        for (i, segment) in segments.iter().enumerate() {
            name.push_str(segment);
            if i < self.nsubs {
                name.push_str(&digits);
            }
        }
        Ok(name)
    }
}

impl fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Split `template` into literal segments and `%b` substitution slots.
pub fn parse_template(template: Arc<str>) -> Result<NameTemplate> {
    if !template.contains('%') {
        return Ok(NameTemplate {
            static_strlen: template.len(),
            template,
            segments: None,
            nsubs: 0,
        });
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut static_strlen = template.len();
    let mut nsubs = 0;

    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            current.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => {
                segments.push(std::mem::take(&mut current));
                static_strlen -= 2;
                nsubs += 1;
            }
            Some('%') => {
                current.push('%');
                static_strlen -= 1;
            }
            Some(other) => {
                return Err(VdsError::BadTemplate(format!(
                    "invalid escape '%{}' in \"{}\"",
                    other, template
                )))
            }
            None => {
                return Err(VdsError::BadTemplate(format!(
                    "dangling '%' at end of \"{}\"",
                    template
                )))
            }
        }
    }
    segments.push(current);

    Ok(NameTemplate {
        template,
        segments: Some(segments),
        static_strlen,
        nsubs,
    })
}
