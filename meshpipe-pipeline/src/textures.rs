//! Texture file detection and PBR channel classification
//!
//! Classification is a pure function of the file name. Rules are tried in
//! order and the first match wins:
//!
//! 1. exact index names (`image_0` .. `image_5`, also with a suffix such as
//!    `image_1_roughness`)
//! 2. keyword suffixes (`_albedo`, `_nrm`, `_metallicRoughness`, ...)
//! 3. generic numbered names (`texture2`, `material_4`, `img0`, ...)
//!
//! Indexed names use the order diffuse, metallic-roughness, normal,
//! roughness, ao, emission.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureChannel {
    Diffuse,
    Normal,
    Metallic,
    Roughness,
    /// Metallic in R, roughness in G
    MetallicRoughness,
    /// Occlusion in R, roughness in G, metallic in B
    OcclusionRoughnessMetallic,
    Ao,
    Emission,
    Unclassified,
}

impl TextureChannel {
    /// Channel order used by index-numbered texture names
    pub const INDEXED: [TextureChannel; 6] = [
        TextureChannel::Diffuse,
        TextureChannel::MetallicRoughness,
        TextureChannel::Normal,
        TextureChannel::Roughness,
        TextureChannel::Ao,
        TextureChannel::Emission,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::INDEXED.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TextureChannel::Diffuse => "diffuse",
            TextureChannel::Normal => "normal",
            TextureChannel::Metallic => "metallic",
            TextureChannel::Roughness => "roughness",
            TextureChannel::MetallicRoughness => "metallic_roughness",
            TextureChannel::OcclusionRoughnessMetallic => "orm",
            TextureChannel::Ao => "ao",
            TextureChannel::Emission => "emission",
            TextureChannel::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for TextureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextureChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diffuse" => Ok(TextureChannel::Diffuse),
            "normal" => Ok(TextureChannel::Normal),
            "metallic" => Ok(TextureChannel::Metallic),
            "roughness" => Ok(TextureChannel::Roughness),
            "metallic_roughness" | "metallicroughness" => Ok(TextureChannel::MetallicRoughness),
            "orm" | "occlusion_roughness_metallic" => Ok(TextureChannel::OcclusionRoughnessMetallic),
            "ao" => Ok(TextureChannel::Ao),
            "emission" => Ok(TextureChannel::Emission),
            "unclassified" => Ok(TextureChannel::Unclassified),
            other => Err(format!("unknown texture channel: {other}")),
        }
    }
}

/// Which rule family produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ExactIndex,
    Keyword,
    NumericIndex,
}

enum Target {
    Fixed(TextureChannel),
    /// Capture group 1 is an index into [`TextureChannel::INDEXED`]
    Indexed,
}

struct Rule {
    kind: RuleKind,
    /// Matched against the lowercase stem
    pattern: Regex,
    target: Target,
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| tracing::error!(pattern, error = %e, "Invalid texture rule"))
        .ok()
}

fn keyword_rule(channel: TextureChannel, keywords: &[&str]) -> Option<Rule> {
    let alternatives: Vec<String> = keywords.iter().map(|k| regex::escape(k)).collect();
    Some(Rule {
        kind: RuleKind::Keyword,
        pattern: compile(&format!("(?:{})", alternatives.join("|")))?,
        target: Target::Fixed(channel),
    })
}

fn indexed_rule(kind: RuleKind, pattern: &str) -> Option<Rule> {
    Some(Rule {
        kind,
        pattern: compile(pattern)?,
        target: Target::Indexed,
    })
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    use TextureChannel::*;
    vec![
        indexed_rule(RuleKind::ExactIndex, r"^image_?([0-5])(?:$|[_\-. ])"),
        // composites first so `_metallicroughness` is not taken as metallic
        keyword_rule(
            OcclusionRoughnessMetallic,
            &["_orm", "occlusionroughnessmetallic", "occlusion_roughness_metallic"],
        ),
        keyword_rule(
            MetallicRoughness,
            &["metallicroughness", "metallic_roughness", "metalroughness"],
        ),
        keyword_rule(
            Diffuse,
            &["_diffuse", "_albedo", "_basecolor", "_base_color", "_color", "_diff", "_alb"],
        ),
        keyword_rule(Normal, &["_normal", "_norm", "_nrm", "_bump", "_normalgl"]),
        keyword_rule(Metallic, &["_metallic", "_metalness", "_metal", "_met"]),
        keyword_rule(Roughness, &["_roughness", "_rough", "_rgh"]),
        keyword_rule(Ao, &["_ao", "_ambient", "_occlusion"]),
        keyword_rule(Emission, &["_emission", "_emissive", "_emit"]),
        indexed_rule(
            RuleKind::NumericIndex,
            r"^(?:texture|material|tex|img|mat)_?([0-5])(?:$|\D)",
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Channel of a single file name and the rule that decided it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub channel: TextureChannel,
    /// `None` when no rule matched
    pub rule: Option<RuleKind>,
}

/// Classify a texture by file name. Paths are reduced to their file name.
pub fn classify(file_name: &str) -> Classification {
    let name = file_name.replace('\\', "/");
    let name = name.rsplit('/').next().unwrap_or_default();
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_lowercase();

    for rule in RULES.iter() {
        let Some(captures) = rule.pattern.captures(&stem) else {
            continue;
        };
        let channel = match rule.target {
            Target::Fixed(channel) => Some(channel),
            Target::Indexed => captures
                .get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .and_then(TextureChannel::from_index),
        };
        if let Some(channel) = channel {
            return Classification {
                channel,
                rule: Some(rule.kind),
            };
        }
    }
    Classification {
        channel: TextureChannel::Unclassified,
        rule: None,
    }
}

/// Shorthand for `classify(name).channel`
pub fn channel_of(file_name: &str) -> TextureChannel {
    classify(file_name).channel
}

const TEXTURE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "tga", "tiff", "tif", "dds", "hdr", "exr", "webp", "ktx", "ktx2",
    "basis",
];

const NON_TEXTURE_KEYWORDS: &[&str] = &[
    "screenshot", "icon", "logo", "thumb", "thumbnail", "preview", "ui", "button", "cursor",
];

/// Whether a file name looks like a texture image.
///
/// Non-texture keywords are matched at the start of name tokens, so
/// `ui_panel.png` is rejected while `building_diffuse.png` is kept.
pub fn is_texture_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    let Some(ext) = Path::new(&lower).extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !TEXTURE_EXTENSIONS.contains(&ext) {
        return false;
    }
    !lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| NON_TEXTURE_KEYWORDS.iter().any(|k| token.starts_with(k)))
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// One texture file and its channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextureRecord {
    pub source: PathBuf,
    pub channel: TextureChannel,
}

impl TextureRecord {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let channel = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(channel_of)
            .unwrap_or(TextureChannel::Unclassified);
        Self { source, channel }
    }

    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Textures collected during a request, keyed by file name.
///
/// The first record inserted for a name wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TextureSet {
    records: BTreeMap<String, TextureRecord>,
}

impl TextureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the name is already present. Returns whether it was added.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        let record = TextureRecord::new(path);
        let name = record.file_name();
        if name.is_empty() || self.records.contains_key(&name) {
            return false;
        }
        self.records.insert(name, record);
        true
    }

    pub fn extend<I, P>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths.into_iter().map(|p| self.insert(p)).filter(|&added| added).count()
    }

    /// Add every texture file directly inside `dir`
    pub fn scan_dir(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_texture_file)
            })
            .collect();
        names.sort();
        Ok(self.extend(names))
    }

    pub fn get(&self, name: &str) -> Option<&TextureRecord> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextureRecord> {
        self.records.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Retarget every record to `dir`, keeping file names
    pub fn relocate(&mut self, dir: &Path) {
        for (name, record) in self.records.iter_mut() {
            record.source = dir.join(name);
        }
    }
}

/// Pick at most one texture per channel for a material.
///
/// Files are considered in name order and the first file seen for a channel
/// keeps it. A metallic-roughness composite wins over an ORM composite, and
/// either suppresses separate metallic and roughness maps. When no diffuse map was found, the first unclassified
/// file becomes the diffuse map.
pub fn assign_channels<'a, I>(records: I) -> BTreeMap<TextureChannel, &'a TextureRecord>
where
    I: IntoIterator<Item = &'a TextureRecord>,
{
    let mut sorted: Vec<&TextureRecord> = records.into_iter().collect();
    sorted.sort_by_key(|r| r.file_name());

    let mut assigned: BTreeMap<TextureChannel, &TextureRecord> = BTreeMap::new();
    let mut first_unclassified = None;
    for record in &sorted {
        match record.channel {
            TextureChannel::Unclassified => {
                first_unclassified.get_or_insert(*record);
            }
            channel => {
                assigned.entry(channel).or_insert(*record);
            }
        }
    }

    if assigned.contains_key(&TextureChannel::MetallicRoughness) {
        assigned.remove(&TextureChannel::OcclusionRoughnessMetallic);
    }
    if assigned.contains_key(&TextureChannel::MetallicRoughness)
        || assigned.contains_key(&TextureChannel::OcclusionRoughnessMetallic)
    {
        assigned.remove(&TextureChannel::Metallic);
        assigned.remove(&TextureChannel::Roughness);
    }
    if !assigned.contains_key(&TextureChannel::Diffuse) {
        if let Some(record) = first_unclassified {
            assigned.insert(TextureChannel::Diffuse, record);
        }
    }
    assigned
}

static TRIPO_TEXTURE: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"^(tripo_image_.*)_([0-3])(?:_diffuse)?\.png$"));

/// Conventional name for a Tripo texture, if `file_name` is one
pub fn tripo_rename(file_name: &str) -> Option<String> {
    let captures = TRIPO_TEXTURE.as_ref()?.captures(file_name)?;
    let stem = captures.get(1)?.as_str();
    let suffix = match captures.get(2)?.as_str() {
        "0" => "basecolor",
        "1" => "metallic",
        "2" => "roughness",
        "3" => "normal",
        _ => return None,
    };
    Some(format!("{stem}_{suffix}.png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use TextureChannel::*;

    // ---- classification ----

    #[test]
    fn test_exact_index_names() {
        let expected = [Diffuse, MetallicRoughness, Normal, Roughness, Ao, Emission];
        for (i, channel) in expected.iter().enumerate() {
            assert_eq!(channel_of(&format!("image_{i}.png")), *channel);
            assert_eq!(channel_of(&format!("Image{i}.jpg")), *channel);
        }
        assert_eq!(classify("image_1.png").rule, Some(RuleKind::ExactIndex));
    }

    #[test]
    fn test_exact_index_wins_over_keyword() {
        let c = classify("image_1_roughness.png");
        assert_eq!(c.channel, MetallicRoughness);
        assert_eq!(c.rule, Some(RuleKind::ExactIndex));
    }

    #[test]
    fn test_keyword_suffixes() {
        assert_eq!(channel_of("foo_metallicRoughness.png"), MetallicRoughness);
        assert_eq!(channel_of("rock_albedo.jpg"), Diffuse);
        assert_eq!(channel_of("rock_BaseColor.png"), Diffuse);
        assert_eq!(channel_of("rock_nrm.png"), Normal);
        assert_eq!(channel_of("rock_normalgl.png"), Normal);
        assert_eq!(channel_of("rock_metalness.png"), Metallic);
        assert_eq!(channel_of("rock_rough.png"), Roughness);
        assert_eq!(channel_of("rock_ao.png"), Ao);
        assert_eq!(channel_of("rock_emissive.png"), Emission);
        assert_eq!(classify("rock_ao.png").rule, Some(RuleKind::Keyword));
    }

    #[test]
    fn test_numeric_fallback() {
        assert_eq!(channel_of("texture2.jpg"), Normal);
        assert_eq!(channel_of("texture_0.png"), Diffuse);
        assert_eq!(channel_of("material4.png"), Ao);
        assert_eq!(classify("texture2.jpg").rule, Some(RuleKind::NumericIndex));
        assert_eq!(channel_of("texture9.png"), Unclassified);
    }

    #[test]
    fn test_unmatched_is_unclassified() {
        let c = classify("wood.png");
        assert_eq!(c.channel, Unclassified);
        assert_eq!(c.rule, None);
    }

    #[test]
    fn test_classification_is_deterministic() {
        for name in ["image_1.png", "foo_metallicRoughness.png", "texture2.jpg", "x.png"] {
            let first = classify(name);
            for _ in 0..5 {
                assert_eq!(classify(name), first);
            }
        }
    }

    #[test]
    fn test_paths_reduce_to_file_name() {
        assert_eq!(channel_of("textures/image_2.png"), Normal);
        assert_eq!(channel_of(r"C:\tex\rock_ao.png"), Ao);
    }

    // ---- detection ----

    #[test]
    fn test_is_texture_file() {
        assert!(is_texture_file("rock_albedo.PNG"));
        assert!(is_texture_file("scan.ktx2"));
        assert!(is_texture_file("building_diffuse.png"));
        assert!(!is_texture_file("model.obj"));
        assert!(!is_texture_file("ui_button.png"));
        assert!(!is_texture_file("preview.jpg"));
        assert!(!is_texture_file("Screenshot_2024.png"));
        assert!(!is_texture_file("noext"));
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://cdn.example.com/a.glb"));
        assert!(is_url("http://example.com"));
        assert!(!is_url("/data/models/a.glb"));
        assert!(!is_url("ftp://example.com/a.glb"));
    }

    // ---- sets and assignment ----

    #[test]
    fn test_texture_set_first_writer_wins() {
        let mut set = TextureSet::new();
        assert!(set.insert("/a/rock_albedo.png"));
        assert!(!set.insert("/b/rock_albedo.png"));
        assert!(set.insert("/b/rock_nrm.png"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("rock_albedo.png").unwrap().source, PathBuf::from("/a/rock_albedo.png"));
        assert_eq!(set.get("rock_nrm.png").unwrap().channel, Normal);
    }

    #[test]
    fn test_scan_dir_skips_non_textures() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_albedo.png", "model.obj", "model.mtl", "thumbnail.png"] {
            std::fs::write(dir.path().join(name), [0u8]).unwrap();
        }
        let mut set = TextureSet::new();
        assert_eq!(set.scan_dir(dir.path()).unwrap(), 1);
        assert_eq!(set.names(), vec!["a_albedo.png".to_string()]);
    }

    #[test]
    fn test_composite_suppresses_metallic_and_roughness() {
        let records = [
            TextureRecord::new("m_basecolor.png"),
            TextureRecord::new("m_metallicroughness.png"),
            TextureRecord::new("m_metallic.png"),
            TextureRecord::new("m_roughness.png"),
        ];
        let assigned = assign_channels(&records);
        assert_eq!(assigned.len(), 2);
        assert!(assigned.contains_key(&Diffuse));
        assert!(assigned.contains_key(&MetallicRoughness));
    }

    #[test]
    fn test_orm_is_its_own_composite() {
        assert_eq!(channel_of("rock_ORM.png"), OcclusionRoughnessMetallic);
        assert_eq!(channel_of("rock_occlusionRoughnessMetallic.png"), OcclusionRoughnessMetallic);
        assert_eq!(channel_of("rock_metallicRoughness.png"), MetallicRoughness);
        // `_normal` must not be read as `_orm`
        assert_eq!(channel_of("rock_normal.png"), Normal);
        assert_eq!("orm".parse::<TextureChannel>(), Ok(OcclusionRoughnessMetallic));

        let records = [
            TextureRecord::new("rock_basecolor.png"),
            TextureRecord::new("rock_orm.png"),
            TextureRecord::new("rock_roughness.png"),
        ];
        let assigned = assign_channels(&records);
        assert_eq!(assigned[&OcclusionRoughnessMetallic].file_name(), "rock_orm.png");
        assert!(!assigned.contains_key(&Roughness));

        let both = [TextureRecord::new("a_orm.png"), TextureRecord::new("a_metallicroughness.png")];
        let assigned = assign_channels(&both);
        assert!(assigned.contains_key(&MetallicRoughness));
        assert!(!assigned.contains_key(&OcclusionRoughnessMetallic));
    }

    #[test]
    fn test_first_unclassified_becomes_diffuse() {
        let records = [
            TextureRecord::new("zeta.png"),
            TextureRecord::new("alpha.png"),
            TextureRecord::new("skin_nrm.png"),
        ];
        let assigned = assign_channels(&records);
        assert_eq!(assigned[&Diffuse].file_name(), "alpha.png");
        assert_eq!(assigned[&Normal].file_name(), "skin_nrm.png");

        let with_diffuse = [TextureRecord::new("a_diffuse.png"), TextureRecord::new("b.png")];
        let assigned = assign_channels(&with_diffuse);
        assert_eq!(assigned[&Diffuse].file_name(), "a_diffuse.png");
        assert_eq!(assigned.len(), 1);
    }

    #[test]
    fn test_tripo_rename() {
        assert_eq!(
            tripo_rename("tripo_image_abc123_0_diffuse.png").as_deref(),
            Some("tripo_image_abc123_basecolor.png")
        );
        assert_eq!(
            tripo_rename("tripo_image_abc123_3.png").as_deref(),
            Some("tripo_image_abc123_normal.png")
        );
        assert_eq!(tripo_rename("tripo_image_abc123_5.png"), None);
        assert_eq!(tripo_rename("rock_albedo.png"), None);
        let renamed = tripo_rename("tripo_image_x_2.png").unwrap();
        assert_eq!(channel_of(&renamed), Roughness);
    }
}
