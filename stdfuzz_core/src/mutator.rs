use rand::Rng;
use rand_core::RngCore;
use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Inclusive length range of the replacement drawn by `ReplaceFirstTagMutator`.
const TAG_NAME_LEN: (usize, usize) = (1, 20);
/// Inclusive length range of the value written by `AttributeValueLengthMutator`.
const ATTRIBUTE_VALUE_LEN: (usize, usize) = (1, 20);
/// Inclusive length range of the text written by `ContentBetweenTagsMutator`.
const TAG_CONTENT_LEN: (usize, usize) = (1, 100);

/// Replacement tag names, well-formed ones first, then malformed ones.
pub const TAG_POOL: [&str; 10] = [
    "div", "header", "footer", "xyz123", "di v", "<div>>", "<html", "html>", "<", ">",
];

static OPENING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\w+").expect("opening tag pattern is valid"));

/// Letters only (general category L), so combining marks keep their case.
static LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}").expect("letter pattern is valid"));

/// A `Mutator` derives one new test case from an existing one.
///
/// Mutators never see each other's output: the engine always hands them the
/// original seed. Randomised mutators draw exclusively from the generator they
/// are given, so a campaign seeded with the same value derives the same inputs.
pub trait Mutator {
    /// Name used in console lines and findings.
    fn name(&self) -> &str;

    /// Produces a mutated copy of `input`.
    ///
    /// # Errors
    /// Any error is fatal for the whole campaign; there is no per-mutator isolation.
    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error>;
}

/// Wraps a closure as a `Mutator`. Handy for one-off strategies and tests.
pub struct FnMutator<F>
where
    F: Fn(&str, &mut dyn RngCore) -> Result<String, anyhow::Error>,
{
    name: String,
    func: F,
}

impl<F> FnMutator<F>
where
    F: Fn(&str, &mut dyn RngCore) -> Result<String, anyhow::Error>,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Mutator for FnMutator<F>
where
    F: Fn(&str, &mut dyn RngCore) -> Result<String, anyhow::Error>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        (self.func)(input, rng)
    }
}

/// Deterministic transformations available to the static mutator set.
///
/// Each variant is one configuration entry: `{ kind = "replace", from = "<html", to = "a" }`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StaticMutation {
    /// Replaces every occurrence of `from` with `to`.
    Replace { from: String, to: String },
    Append { suffix: String },
    Prepend { prefix: String },
    /// Ignores the input entirely, e.g. an empty or whitespace-only input.
    Constant { value: String },
    /// Keeps the first half of the characters.
    TruncateHalf,
    Uppercase,
    Lowercase,
    Reverse,
    /// Trims the input and surrounds it with `width` spaces on both sides.
    PadWhitespace { width: usize },
    /// `>` becomes `&gt;`, then `<` becomes `&lt;`.
    EscapeAngleBrackets,
    DoubleOpenAngle,
}

impl StaticMutation {
    pub fn apply(&self, input: &str) -> String {
        match self {
            StaticMutation::Replace { from, to } => input.replace(from.as_str(), to),
            StaticMutation::Append { suffix } => format!("{input}{suffix}"),
            StaticMutation::Prepend { prefix } => format!("{prefix}{input}"),
            StaticMutation::Constant { value } => value.clone(),
            StaticMutation::TruncateHalf => {
                let keep = input.chars().count() / 2;
                input.chars().take(keep).collect()
            }
            StaticMutation::Uppercase => input.to_uppercase(),
            StaticMutation::Lowercase => input.to_lowercase(),
            StaticMutation::Reverse => input.chars().rev().collect(),
            StaticMutation::PadWhitespace { width } => {
                let pad = " ".repeat(*width);
                format!("{pad}{}{pad}", input.trim())
            }
            StaticMutation::EscapeAngleBrackets => input.replace('>', "&gt;").replace('<', "&lt;"),
            StaticMutation::DoubleOpenAngle => input.replace('<', "<<"),
        }
    }
}

impl fmt::Display for StaticMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticMutation::Replace { from, to } => write!(f, "replace({from:?} -> {to:?})"),
            StaticMutation::Append { suffix } => write!(f, "append({suffix:?})"),
            StaticMutation::Prepend { prefix } => write!(f, "prepend({prefix:?})"),
            StaticMutation::Constant { value } => write!(f, "constant({value:?})"),
            StaticMutation::TruncateHalf => f.write_str("truncate-half"),
            StaticMutation::Uppercase => f.write_str("uppercase"),
            StaticMutation::Lowercase => f.write_str("lowercase"),
            StaticMutation::Reverse => f.write_str("reverse"),
            StaticMutation::PadWhitespace { width } => write!(f, "pad-whitespace({width})"),
            StaticMutation::EscapeAngleBrackets => f.write_str("escape-angle-brackets"),
            StaticMutation::DoubleOpenAngle => f.write_str("double-open-angle"),
        }
    }
}

/// One entry of the static mutator registry.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StaticMutatorEntry {
    #[serde(flatten)]
    pub mutation: StaticMutation,
    /// Overrides the generated name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StaticMutatorEntry {
    pub fn new(mutation: StaticMutation) -> Self {
        Self {
            mutation,
            name: None,
            enabled: true,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.mutation.to_string())
    }

    pub fn build(&self) -> StaticMutator {
        StaticMutator {
            name: self.display_name(),
            mutation: self.mutation.clone(),
        }
    }
}

/// The default static set: the two `<html` replacements.
pub fn default_static_entries() -> Vec<StaticMutatorEntry> {
    vec![
        StaticMutatorEntry::new(StaticMutation::Replace {
            from: "<html".to_string(),
            to: "a".to_string(),
        }),
        StaticMutatorEntry::new(StaticMutation::Replace {
            from: "<html".to_string(),
            to: String::new(),
        }),
    ]
}

#[derive(Debug, Clone)]
pub struct StaticMutator {
    name: String,
    mutation: StaticMutation,
}

impl Mutator for StaticMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, _rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        Ok(self.mutation.apply(input))
    }
}

/// The randomised transformation kinds making up one round of the dynamic set.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DynamicKind {
    InsertRandomChar,
    RemoveRandomSubstring,
    ReplaceFirstTag,
    RandomizeCase,
    AttributeValueLength,
    ContentBetweenTags,
}

impl DynamicKind {
    /// Template order of one round.
    pub const ALL: [DynamicKind; 6] = [
        DynamicKind::InsertRandomChar,
        DynamicKind::RemoveRandomSubstring,
        DynamicKind::ReplaceFirstTag,
        DynamicKind::RandomizeCase,
        DynamicKind::AttributeValueLength,
        DynamicKind::ContentBetweenTags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DynamicKind::InsertRandomChar => "insert-random-char",
            DynamicKind::RemoveRandomSubstring => "remove-random-substring",
            DynamicKind::ReplaceFirstTag => "replace-first-tag",
            DynamicKind::RandomizeCase => "randomize-case",
            DynamicKind::AttributeValueLength => "attribute-value-length",
            DynamicKind::ContentBetweenTags => "content-between-tags",
        }
    }

    /// Instantiates this kind; `round` only feeds the instance name.
    pub fn build(&self, round: usize, attribute_name: &str) -> Box<dyn Mutator> {
        let name = format!("{}#{}", self.as_str(), round);
        match self {
            DynamicKind::InsertRandomChar => Box::new(InsertRandomCharMutator { name }),
            DynamicKind::RemoveRandomSubstring => Box::new(RemoveRandomSubstringMutator { name }),
            DynamicKind::ReplaceFirstTag => Box::new(ReplaceFirstTagMutator { name }),
            DynamicKind::RandomizeCase => Box::new(RandomizeCaseMutator { name }),
            DynamicKind::AttributeValueLength => {
                Box::new(AttributeValueLengthMutator::new(name, attribute_name))
            }
            DynamicKind::ContentBetweenTags => Box::new(ContentBetweenTagsMutator { name }),
        }
    }
}

impl fmt::Display for DynamicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn random_lowercase_letter(rng: &mut dyn RngCore) -> char {
    char::from(rng.random_range(b'a'..=b'z'))
}

fn random_lowercase_string(rng: &mut dyn RngCore, (min, max): (usize, usize)) -> String {
    let len = rng.random_range(min..=max);
    (0..len).map(|_| random_lowercase_letter(rng)).collect()
}

/// Byte offset of the `char_idx`-th character, or the end of the string.
fn byte_offset(input: &str, char_idx: usize) -> usize {
    input
        .char_indices()
        .nth(char_idx)
        .map_or(input.len(), |(offset, _)| offset)
}

/// Inserts one random lowercase letter at a random position in `[0, len]`.
pub struct InsertRandomCharMutator {
    name: String,
}

impl Mutator for InsertRandomCharMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        if input.is_empty() {
            return Ok(input.to_string());
        }
        let position = rng.random_range(0..=input.chars().count());
        let letter = random_lowercase_letter(rng);

        let mut mutated = input.to_string();
        mutated.insert(byte_offset(input, position), letter);
        Ok(mutated)
    }
}

/// Deletes a random span starting in the first half of the input.
pub struct RemoveRandomSubstringMutator {
    name: String,
}

impl Mutator for RemoveRandomSubstringMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        let len = input.chars().count();
        if len < 2 {
            return Ok(input.to_string());
        }
        let start = rng.random_range(0..len / 2);
        let span = rng.random_range(0..len - start);

        let start_byte = byte_offset(input, start);
        let end_byte = byte_offset(input, start + span);
        Ok(format!("{}{}", &input[..start_byte], &input[end_byte..]))
    }
}

/// Swaps the first `<name` token for a random name or an entry of `TAG_POOL`.
pub struct ReplaceFirstTagMutator {
    name: String,
}

impl Mutator for ReplaceFirstTagMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        let replacement = if rng.random_bool(0.5) {
            random_lowercase_string(rng, TAG_NAME_LEN)
        } else {
            TAG_POOL[rng.random_range(0..TAG_POOL.len())].to_string()
        };
        let replacement = format!("<{replacement}");
        Ok(OPENING_TAG
            .replacen(input, 1, NoExpand(&replacement))
            .into_owned())
    }
}

/// Flips a coin per letter to pick its upper or lower case form.
pub struct RandomizeCaseMutator {
    name: String,
}

fn single_char<I: Iterator<Item = char>>(mut mapped: I) -> Option<char> {
    match (mapped.next(), mapped.next()) {
        (Some(single), None) => Some(single),
        _ => None,
    }
}

/// Case mapping restricted to single-character results so the length never changes.
fn single_char_case(c: char, upper: bool) -> char {
    let mapped = if upper {
        single_char(c.to_uppercase())
    } else {
        single_char(c.to_lowercase())
    };
    mapped.unwrap_or(c)
}

impl Mutator for RandomizeCaseMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        let flipped = LETTER.replace_all(input, |caps: &Captures<'_>| {
            caps[0]
                .chars()
                .map(|c| single_char_case(c, rng.random_bool(0.5)))
                .collect::<String>()
        });
        Ok(flipped.into_owned())
    }
}

/// Rewrites the first `name="…"` value with a random string of random length.
pub struct AttributeValueLengthMutator {
    name: String,
    marker: String,
    pattern: Regex,
}

impl AttributeValueLengthMutator {
    pub fn new(name: impl Into<String>, attribute_name: &str) -> Self {
        let pattern = Regex::new(&format!(r#"{}="[^"]*""#, regex::escape(attribute_name)))
            .expect("escaped attribute pattern is valid");
        Self {
            name: name.into(),
            marker: format!("{attribute_name}=\""),
            pattern,
        }
    }
}

impl Mutator for AttributeValueLengthMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        if !input.contains(&self.marker) {
            return Ok(input.to_string());
        }
        let value = random_lowercase_string(rng, ATTRIBUTE_VALUE_LEN);
        let replacement = format!("{}{value}\"", self.marker);
        Ok(self
            .pattern
            .replacen(input, 1, NoExpand(&replacement))
            .into_owned())
    }
}

/// Replaces the text between the first `>` and the following `<`.
pub struct ContentBetweenTagsMutator {
    name: String,
}

impl Mutator for ContentBetweenTagsMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, input: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        let Some(open) = input.find('>') else {
            return Ok(input.to_string());
        };
        let Some(close) = input[open + 1..].find('<').map(|rel| open + 1 + rel) else {
            return Ok(input.to_string());
        };
        let content = random_lowercase_string(rng, TAG_CONTENT_LEN);
        Ok(format!("{}{content}{}", &input[..=open], &input[close..]))
    }
}

/// An ordered collection of mutators. Position is the only ordering that matters.
#[derive(Default)]
pub struct MutatorSet {
    mutators: Vec<Box<dyn Mutator>>,
}

impl MutatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the static set from registry entries, skipping disabled ones.
    pub fn from_static(entries: &[StaticMutatorEntry]) -> Self {
        let mut set = Self::new();
        for entry in entries.iter().filter(|entry| entry.enabled) {
            set.push(Box::new(entry.build()));
        }
        set
    }

    /// Builds the dynamic set: `repeat_count` rounds of `kinds`, in template order.
    pub fn from_dynamic(kinds: &[DynamicKind], repeat_count: usize, attribute_name: &str) -> Self {
        let mut set = Self::new();
        for round in 0..repeat_count {
            for kind in kinds {
                set.push(kind.build(round, attribute_name));
            }
        }
        set
    }

    pub fn push(&mut self, mutator: Box<dyn Mutator>) {
        self.mutators.push(mutator);
    }

    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Mutator> {
        self.mutators.iter().map(|m| m.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|m| m.name()).collect()
    }
}

impl fmt::Debug for MutatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
