//! Shader Source Code Builder
//!
//! Pure text transformation: a shader blueprint template plus the active
//! [`ShaderProperties`] produce final compilable source code, deterministically.
//!
//! The template language is a small `@directive` preprocessor. Passes run in a
//! fixed order, each consuming the previous pass's output buffer:
//!
//! 1. `parse_math` — `@math(expr)` inline integer arithmetic; unresolvable
//!    expressions are a hard error.
//! 2. `parse_foreach` — `@foreach(count, n) ... @end` unrolling with `@n`
//!    counter substitution.
//! 3. `parse_properties` — `@property(cond) ... @else ... @end` conditional
//!    blocks (absent properties are falsy), plus `@set(name, expr)` and
//!    `@add(name, expr)` property mutation.
//! 4. `collect_pieces` — `@piece(Name) ... @end` fragments gathered without
//!    being emitted inline.
//! 5. `insert_pieces` — `@insertpiece(Name)` substitution; an unknown piece is
//!    a hard error (malformed blueprint or piece asset).
//! 6. `parse_counter` — `@counter(name)` auto-incrementing per-name integers,
//!    reset per build invocation.
//! 7. `parse_values` — `@value(name)` literal property substitution.
//!
//! Shader piece assets are processed through passes 1–4 before the blueprint
//! body, so `@piece` definitions from piece files are visible to the
//! blueprint's `@insertpiece` references. Every pass is idempotent with
//! respect to already-resolved text; a second run over fully-resolved source
//! is a no-op.
//!
//! A syntax or reference error aborts the build for that shader stage — the
//! caller gets an error, never a partial or garbage shader.

mod math;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::asset::AssetId;
use crate::blueprint::{ShaderBlueprintResource, ShaderPieceResource};
use crate::error::{CrucibleError, Result};
use crate::hash::Fnv1a64;
use crate::properties::{ShaderProperties, ShaderPropertyId};

use math::UndefinedBehavior;

/// Piece references may nest (a piece inserting another piece); this caps the
/// resolution depth so cyclic references fail instead of spinning.
const MAX_INSERT_PIECE_DEPTH: usize = 16;

/// Directives that open an `@end`-terminated block.
const BLOCK_OPENERS: [&str; 3] = ["@property(", "@foreach(", "@piece("];

/// Result of one shader build.
#[derive(Debug, Clone)]
pub struct BuildShader {
    /// Final compilable source code.
    pub source_code: String,
    /// Every asset that contributed text: shader pieces in include order,
    /// then the blueprint itself. Inline capacity covers typical include
    /// counts.
    pub asset_ids: SmallVec<[AssetId; 8]>,
    /// Rolling FNV1a-64 over each contributing asset's file hash, in
    /// `asset_ids` order. Stable across runs for unchanged assets.
    pub combined_asset_file_hash: u64,
}

/// Property-driven shader source code builder.
///
/// Holds the per-build working state: a mutable copy of the input properties
/// (`@set`/`@add` must not leak into the caller's set), collected dynamic
/// pieces, and the `@counter` table. Reusable; state resets on every
/// [`Self::build`] call.
#[derive(Debug, Default)]
pub struct ShaderBuilder {
    properties: ShaderProperties,
    dynamic_pieces: FxHashMap<String, String>,
    counters: FxHashMap<String, i64>,
}

impl ShaderBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build final shader source code from a blueprint, its shader pieces and
    /// the active property set.
    pub fn build(
        &mut self,
        blueprint: &ShaderBlueprintResource,
        pieces: &[Arc<ShaderPieceResource>],
        properties: &ShaderProperties,
    ) -> Result<BuildShader> {
        self.properties = properties.clone();
        self.dynamic_pieces.clear();
        self.counters.clear();

        let mut asset_ids = SmallVec::with_capacity(pieces.len() + 1);
        let mut combined_hash = Fnv1a64::new();

        for piece in pieces {
            let leftover = self.run_collection_passes(&piece.source_code)?;
            if !leftover.trim().is_empty() {
                log::debug!(
                    "shader piece {:?} has text outside @piece blocks; ignored",
                    piece.asset_id
                );
            }
            asset_ids.push(piece.asset_id);
            combined_hash.write_u64(piece.file_hash);
        }

        let mut source = self.run_collection_passes(&blueprint.source_code)?;
        source = self.insert_pieces(&source)?;
        source = self.parse_counter(&source)?;
        source = self.parse_values(&source)?;

        asset_ids.push(blueprint.asset_id);
        combined_hash.write_u64(blueprint.file_hash);

        Ok(BuildShader {
            source_code: source,
            asset_ids,
            combined_asset_file_hash: combined_hash.finish(),
        })
    }

    /// Passes 1–4: math, foreach, properties, piece collection.
    fn run_collection_passes(&mut self, input: &str) -> Result<String> {
        let text = self.parse_math(input)?;
        let text = self.parse_foreach(&text)?;
        let text = self.parse_properties(&text)?;
        self.collect_pieces(&text)
    }

    // ── Pass 1: @math ────────────────────────────────────────────────────────

    fn parse_math(&self, input: &str) -> Result<String> {
        let mut output = String::with_capacity(input.len());
        let mut cursor = 0;
        while let Some(found) = input[cursor..].find("@math(") {
            let at = cursor + found;
            output.push_str(&input[cursor..at]);
            let (expression, after) =
                extract_parenthesized(input, "math", at + "@math".len())?;
            let value =
                math::evaluate(&expression, &self.properties, UndefinedBehavior::Error)?;
            output.push_str(&value.to_string());
            cursor = after;
        }
        output.push_str(&input[cursor..]);
        Ok(output)
    }

    // ── Pass 2: @foreach ─────────────────────────────────────────────────────

    fn parse_foreach(&self, input: &str) -> Result<String> {
        let mut text = input.to_string();
        // Re-scanning from the start after each expansion handles nested
        // @foreach blocks reintroduced by the outer unroll.
        while let Some(at) = text.find("@foreach(") {
            let (args, body_start) =
                extract_parenthesized(&text, "foreach", at + "@foreach".len())?;
            let block = scan_block(&text, "foreach", body_start, false)?;

            let mut parts = args.splitn(2, ',');
            let count_expression = parts.next().unwrap_or("").trim();
            let counter_token = parts.next().map_or("n", str::trim);
            if !is_identifier(counter_token) {
                return Err(CrucibleError::TemplateSyntax {
                    directive: "foreach",
                    message: format!("`{counter_token}` is not a valid counter token"),
                });
            }

            let count =
                math::evaluate(count_expression, &self.properties, UndefinedBehavior::Error)?;
            if count < 0 {
                return Err(CrucibleError::TemplateSyntax {
                    directive: "foreach",
                    message: format!("negative iteration count {count}"),
                });
            }

            let body = text[body_start..block.end].to_string();
            let mut expansion = String::with_capacity(body.len() * count as usize);
            for i in 0..count {
                expansion.push_str(&substitute_counter_token(&body, counter_token, i));
            }
            text.replace_range(at..block.after_end, &expansion);
        }
        Ok(text)
    }

    // ── Pass 3: @property / @set / @add ──────────────────────────────────────

    fn parse_properties(&mut self, input: &str) -> Result<String> {
        let mut text = input.to_string();
        loop {
            let property_at = text.find("@property(");
            let set_at = text.find("@set(");
            let add_at = text.find("@add(");

            let Some(at) = [property_at, set_at, add_at].into_iter().flatten().min() else {
                return Ok(text);
            };

            if Some(at) == property_at {
                let (condition, body_start) =
                    extract_parenthesized(&text, "property", at + "@property".len())?;
                let block = scan_block(&text, "property", body_start, true)?;
                let truthy =
                    math::evaluate(&condition, &self.properties, UndefinedBehavior::Zero)? != 0;
                let chosen = match (truthy, block.else_at) {
                    (true, Some(else_at)) => text[body_start..else_at].to_string(),
                    (true, None) => text[body_start..block.end].to_string(),
                    (false, Some(else_at)) => text[else_at + "@else".len()..block.end].to_string(),
                    (false, None) => String::new(),
                };
                text.replace_range(at..block.after_end, &chosen);
            } else {
                let is_add = Some(at) == add_at;
                let directive: &'static str = if is_add { "add" } else { "set" };
                let open = at + if is_add { "@add".len() } else { "@set".len() };
                let (args, after) = extract_parenthesized(&text, directive, open)?;

                let mut parts = args.splitn(2, ',');
                let name = parts.next().unwrap_or("").trim();
                let expression = parts.next().map(str::trim).ok_or_else(|| {
                    CrucibleError::TemplateSyntax {
                        directive,
                        message: "expected (name, expression)".to_string(),
                    }
                })?;
                if !is_identifier(name) {
                    return Err(CrucibleError::TemplateSyntax {
                        directive,
                        message: format!("`{name}` is not a valid property name"),
                    });
                }

                let value =
                    math::evaluate(expression, &self.properties, UndefinedBehavior::Zero)?;
                let id = ShaderPropertyId::from_name(name);
                let new_value = if is_add {
                    i64::from(self.properties.get_property_value_or(id, 0)) + value
                } else {
                    value
                };
                self.properties.set_property_value(id, new_value as i32);
                text.replace_range(at..after, "");
            }
        }
    }

    // ── Pass 4: @piece collection ────────────────────────────────────────────

    fn collect_pieces(&mut self, input: &str) -> Result<String> {
        let mut text = input.to_string();
        while let Some(at) = text.find("@piece(") {
            let (name, body_start) =
                extract_parenthesized(&text, "piece", at + "@piece".len())?;
            let name = name.trim().to_string();
            if !is_identifier(&name) {
                return Err(CrucibleError::TemplateSyntax {
                    directive: "piece",
                    message: format!("`{name}` is not a valid piece name"),
                });
            }
            let block = scan_block(&text, "piece", body_start, false)?;
            let body = text[body_start..block.end].to_string();
            if self.dynamic_pieces.insert(name.clone(), body).is_some() {
                log::debug!("shader piece `{name}` redefined; last definition wins");
            }
            text.replace_range(at..block.after_end, "");
        }
        Ok(text)
    }

    // ── Pass 5: @insertpiece ─────────────────────────────────────────────────

    fn insert_pieces(&self, input: &str) -> Result<String> {
        let mut text = input.to_string();
        for _ in 0..MAX_INSERT_PIECE_DEPTH {
            if !text.contains("@insertpiece(") {
                return Ok(text);
            }
            let mut output = String::with_capacity(text.len());
            let mut cursor = 0;
            while let Some(found) = text[cursor..].find("@insertpiece(") {
                let at = cursor + found;
                output.push_str(&text[cursor..at]);
                let (name, after) =
                    extract_parenthesized(&text, "insertpiece", at + "@insertpiece".len())?;
                let name = name.trim();
                let body = self
                    .dynamic_pieces
                    .get(name)
                    .ok_or_else(|| CrucibleError::UnknownShaderPiece(name.to_string()))?;
                output.push_str(body);
                cursor = after;
            }
            output.push_str(&text[cursor..]);
            text = output;
        }
        Err(CrucibleError::TemplateSyntax {
            directive: "insertpiece",
            message: format!(
                "piece references nest deeper than {MAX_INSERT_PIECE_DEPTH} levels (cyclic include?)"
            ),
        })
    }

    // ── Pass 6: @counter ─────────────────────────────────────────────────────

    fn parse_counter(&mut self, input: &str) -> Result<String> {
        let mut output = String::with_capacity(input.len());
        let mut cursor = 0;
        while let Some(found) = input[cursor..].find("@counter(") {
            let at = cursor + found;
            output.push_str(&input[cursor..at]);
            let (name, after) =
                extract_parenthesized(input, "counter", at + "@counter".len())?;
            let name = name.trim();
            if !is_identifier(name) {
                return Err(CrucibleError::TemplateSyntax {
                    directive: "counter",
                    message: format!("`{name}` is not a valid counter name"),
                });
            }
            let slot = self.counters.entry(name.to_string()).or_insert(0);
            output.push_str(&slot.to_string());
            *slot += 1;
            cursor = after;
        }
        output.push_str(&input[cursor..]);
        Ok(output)
    }

    // ── Pass 7: @value ───────────────────────────────────────────────────────

    fn parse_values(&self, input: &str) -> Result<String> {
        let mut output = String::with_capacity(input.len());
        let mut cursor = 0;
        while let Some(found) = input[cursor..].find("@value(") {
            let at = cursor + found;
            output.push_str(&input[cursor..at]);
            let (name, after) = extract_parenthesized(input, "value", at + "@value".len())?;
            let name = name.trim();
            let id = ShaderPropertyId::from_name(name);
            let value = self
                .properties
                .get_property_value(id)
                .ok_or_else(|| CrucibleError::UnknownShaderProperty(name.to_string()))?;
            output.push_str(&value.to_string());
            cursor = after;
        }
        output.push_str(&input[cursor..]);
        Ok(output)
    }
}

// ─── Scanning helpers ─────────────────────────────────────────────────────────

struct BlockSpan {
    /// Byte index of the terminating `@end`.
    end: usize,
    /// Byte index just past the `@end`.
    after_end: usize,
    /// Byte index of a depth-0 `@else`, if present and tracked.
    else_at: Option<usize>,
}

/// Extract the balanced-parenthesis argument list starting at `open`
/// (which must point at `(`). Returns the argument text and the byte index
/// just past the closing parenthesis.
fn extract_parenthesized(
    text: &str,
    directive: &'static str,
    open: usize,
) -> Result<(String, usize)> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return Err(CrucibleError::TemplateSyntax {
            directive,
            message: "expected `(`".to_string(),
        });
    }
    let mut depth = 0usize;
    for (offset, &byte) in bytes[open..].iter().enumerate() {
        match byte {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    let close = open + offset;
                    return Ok((text[open + 1..close].to_string(), close + 1));
                }
            }
            _ => {}
        }
    }
    Err(CrucibleError::TemplateSyntax {
        directive,
        message: "unbalanced parentheses".to_string(),
    })
}

/// Find the `@end` matching the block whose body starts at `body_start`,
/// accounting for nested `@property`/`@foreach`/`@piece` blocks. When
/// `track_else` is set, also reports the first depth-0 `@else`.
fn scan_block(
    text: &str,
    directive: &'static str,
    body_start: usize,
    track_else: bool,
) -> Result<BlockSpan> {
    let mut cursor = body_start;
    let mut depth = 0usize;
    let mut else_at = None;

    loop {
        let rest = &text[cursor..];
        let end_rel = rest.find("@end").ok_or_else(|| CrucibleError::TemplateSyntax {
            directive,
            message: "missing matching @end".to_string(),
        })?;
        let opener_rel = BLOCK_OPENERS
            .iter()
            .filter_map(|opener| rest.find(opener).map(|i| (i, opener.len())))
            .min_by_key(|&(i, _)| i);
        let else_rel = rest.find("@else");

        // Earliest token wins.
        let mut next = end_rel;
        if let Some((i, _)) = opener_rel {
            next = next.min(i);
        }
        if let Some(i) = else_rel {
            next = next.min(i);
        }

        if Some(next) == else_rel && Some(next) != Some(end_rel) {
            if depth == 0 && track_else {
                if else_at.is_some() {
                    return Err(CrucibleError::TemplateSyntax {
                        directive,
                        message: "duplicate @else in block".to_string(),
                    });
                }
                else_at = Some(cursor + next);
            }
            cursor += next + "@else".len();
        } else if let Some((opener_at, opener_len)) = opener_rel.filter(|&(i, _)| i == next) {
            depth += 1;
            cursor += opener_at + opener_len;
        } else {
            // @end
            if depth == 0 {
                return Ok(BlockSpan {
                    end: cursor + end_rel,
                    after_end: cursor + end_rel + "@end".len(),
                    else_at,
                });
            }
            depth -= 1;
            cursor += end_rel + "@end".len();
        }
    }
}

/// Replace `@token` occurrences in `body` with `value`, respecting identifier
/// boundaries so `@n` does not rewrite the prefix of `@normal`.
fn substitute_counter_token(body: &str, token: &str, value: i64) -> String {
    let needle = format!("@{token}");
    let replacement = value.to_string();
    let mut output = String::with_capacity(body.len());
    let mut cursor = 0;
    while let Some(found) = body[cursor..].find(&needle) {
        let at = cursor + found;
        let boundary = at + needle.len();
        let continues_identifier = body[boundary..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if continues_identifier {
            output.push_str(&body[cursor..boundary]);
        } else {
            output.push_str(&body[cursor..at]);
            output.push_str(&replacement);
        }
        cursor = boundary;
    }
    output.push_str(&body[cursor..]);
    output
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
