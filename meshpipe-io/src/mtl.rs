//! MTL material libraries
//!
//! Material values are read through `tobj` into a [`MaterialLibrary`].
//! Rewriting goes through [`MtlDocument`], which keeps directives as raw lines
//! so that unknown statements survive a read-modify-write cycle untouched.

use crate::IoError;
use meshpipe_core::Result;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// One material as parsed by `tobj`
pub type LibraryMaterial = tobj::Material;

/// Parsed material values, in file order
#[derive(Debug, Clone, Default)]
pub struct MaterialLibrary {
    pub materials: Vec<LibraryMaterial>,
}

impl MaterialLibrary {
    pub fn parse(text: &str) -> std::result::Result<Self, IoError> {
        Self::from_reader(&mut text.as_bytes())
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::from_reader(&mut BufReader::new(file))?)
    }

    fn from_reader<R: std::io::BufRead>(reader: &mut R) -> std::result::Result<Self, IoError> {
        let (materials, _) = tobj::load_mtl_buf(reader).map_err(|e| IoError::Malformed {
            format: "MTL",
            message: e.to_string(),
        })?;
        Ok(Self { materials })
    }

    pub fn material(&self, name: &str) -> Option<&LibraryMaterial> {
        self.materials.iter().find(|m| m.name == name)
    }

    /// File names of every referenced texture, first occurrence order
    pub fn texture_files(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for material in &self.materials {
            for map in material_maps(material) {
                let file = map.file_name();
                if !file.is_empty() && !seen.contains(&file) {
                    seen.push(file);
                }
            }
        }
        seen
    }
}

/// Texture references of a parsed material: the maps `tobj` knows by name,
/// then any other `map_*` style directive in name order
pub fn material_maps(material: &LibraryMaterial) -> Vec<MapReference> {
    let known = [
        ("map_Kd", &material.diffuse_texture),
        ("map_Bump", &material.normal_texture),
        ("map_Ks", &material.specular_texture),
        ("map_Ka", &material.ambient_texture),
        ("map_Ns", &material.shininess_texture),
        ("map_d", &material.dissolve_texture),
    ];
    let mut maps: Vec<MapReference> = known
        .into_iter()
        .filter_map(|(directive, value)| {
            Some(MapReference {
                directive: directive.to_string(),
                path: parse_map_path(value.as_deref()?)?,
            })
        })
        .collect();

    let mut extra: Vec<(&String, &String)> = material
        .unknown_param
        .iter()
        .filter(|(key, _)| is_map_directive(key))
        .collect();
    extra.sort();
    maps.extend(extra.into_iter().filter_map(|(key, value)| {
        Some(MapReference {
            directive: key.clone(),
            path: parse_map_path(value)?,
        })
    }));
    maps
}

/// Diffuse color from `Kd`
pub fn diffuse_color(material: &LibraryMaterial) -> Option<[f32; 3]> {
    material.diffuse
}

/// Opacity from `d`, or `1 - Tr`
pub fn opacity(material: &LibraryMaterial) -> Option<f32> {
    material.dissolve.or_else(|| {
        let tr: f32 = material.unknown_param.get("Tr")?.trim().parse().ok()?;
        Some(1.0 - tr)
    })
}

/// One `newmtl` block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MtlMaterial {
    pub name: String,
    /// Directive lines inside the block, trimmed, without the `newmtl` line
    pub lines: Vec<String>,
}

/// A whole material library
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MtlDocument {
    /// Lines before the first `newmtl` (comments, usually)
    pub preamble: Vec<String>,
    pub materials: Vec<MtlMaterial>,
}

/// A texture reference inside a material block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReference {
    pub directive: String,
    pub path: String,
}

impl MapReference {
    /// File name component of the referenced path
    pub fn file_name(&self) -> String {
        self.path
            .replace('\\', "/")
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Whether a directive keyword references a texture
pub fn is_map_directive(keyword: &str) -> bool {
    let lower = keyword.to_ascii_lowercase();
    lower.starts_with("map_") || matches!(lower.as_str(), "bump" | "norm" | "disp" | "decal" | "refl")
}

/// Maximum number of arguments taken by a texture option
fn option_arity(option: &str) -> Option<usize> {
    match option {
        "-bm" | "-blendu" | "-blendv" | "-boost" | "-cc" | "-clamp" | "-imfchan" | "-texres"
        | "-type" => Some(1),
        "-mm" => Some(2),
        "-o" | "-s" | "-t" => Some(3),
        _ => None,
    }
}

/// Extract the file path from the arguments of a map directive, skipping options
pub fn parse_map_path(args: &str) -> Option<String> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        let option = tokens[i];
        let Some(max) = option_arity(option) else {
            break;
        };
        i += 1;
        let mut taken = 0;
        // the last token is always left for the path
        while taken < max && i + 1 < tokens.len() {
            let word_arg = taken == 0
                && matches!(option, "-blendu" | "-blendv" | "-cc" | "-clamp" | "-imfchan" | "-type");
            if tokens[i].parse::<f32>().is_err() && !word_arg {
                break;
            }
            i += 1;
            taken += 1;
        }
    }
    (i < tokens.len()).then(|| tokens[i..].join(" "))
}

impl MtlMaterial {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lines: Vec::new(),
        }
    }

    /// Material used when a library has no blocks at all
    pub fn default_block(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lines: vec![
                "Ka 1.000000 1.000000 1.000000".to_string(),
                "Kd 0.800000 0.800000 0.800000".to_string(),
                "Ks 0.500000 0.500000 0.500000".to_string(),
                "Ns 50.000000".to_string(),
                "d 1.000000".to_string(),
                "illum 2".to_string(),
            ],
        }
    }

    /// Texture references in block order
    pub fn maps(&self) -> Vec<MapReference> {
        self.lines
            .iter()
            .filter_map(|line| {
                let (keyword, rest) = line.split_once(char::is_whitespace)?;
                if !is_map_directive(keyword) {
                    return None;
                }
                Some(MapReference {
                    directive: keyword.to_string(),
                    path: parse_map_path(rest)?,
                })
            })
            .collect()
    }

    /// Drop every texture directive
    pub fn remove_maps(&mut self) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| {
            let keyword = line.split_whitespace().next().unwrap_or("");
            !is_map_directive(keyword)
        });
        before - self.lines.len()
    }

    /// Rewrite every map path to its bare file name
    pub fn flatten_map_paths(&mut self) {
        for line in &mut self.lines {
            let Some((keyword, rest)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            if !is_map_directive(keyword) {
                continue;
            }
            if let Some(path) = parse_map_path(rest) {
                let reference = MapReference {
                    directive: keyword.to_string(),
                    path: path.clone(),
                };
                let file = reference.file_name();
                if file != path {
                    if let Some(pos) = line.rfind(&path) {
                        line.replace_range(pos..pos + path.len(), &file);
                    }
                }
            }
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

impl MtlDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = MtlDocument::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix("newmtl") {
                doc.materials.push(MtlMaterial::new(name.trim()));
                continue;
            }
            match doc.materials.last_mut() {
                Some(material) => material.push(line),
                None => doc.preamble.push(line.to_string()),
            }
        }
        doc
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&text))
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_string())?;
        Ok(())
    }

    pub fn material(&self, name: &str) -> Option<&MtlMaterial> {
        self.materials.iter().find(|m| m.name == name)
    }

    pub fn material_mut(&mut self, name: &str) -> Option<&mut MtlMaterial> {
        self.materials.iter_mut().find(|m| m.name == name)
    }

}

impl fmt::Display for MtlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.preamble {
            writeln!(f, "{line}")?;
        }
        for material in &self.materials {
            writeln!(f)?;
            writeln!(f, "newmtl {}", material.name)?;
            for line in &material.lines {
                writeln!(f, "{line}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# exported
newmtl body
Kd 0.5 0.25 1.0
map_Kd -s 1 1 1 textures\\body_diffuse.png
map_Bump -bm 1.0 body normal.png
newmtl eyes
Ka 1 1 1
map_Kd eyes.png
";

    #[test]
    fn test_parse_blocks() {
        let doc = MtlDocument::parse(SAMPLE);
        assert_eq!(doc.preamble, vec!["# exported".to_string()]);
        assert_eq!(doc.materials.len(), 2);
        assert_eq!(doc.materials[0].name, "body");
    }

    #[test]
    fn test_library_values() {
        let library = MaterialLibrary::parse(SAMPLE).unwrap();
        assert_eq!(library.materials.len(), 2);
        let body = library.material("body").unwrap();
        assert_eq!(diffuse_color(body), Some([0.5, 0.25, 1.0]));
        assert_eq!(opacity(body), None);
    }

    #[test]
    fn test_library_opacity_from_transparency() {
        let library = MaterialLibrary::parse("newmtl glass\nTr 0.25\n").unwrap();
        let glass = library.material("glass").unwrap();
        assert!((opacity(glass).unwrap() - 0.75).abs() < 1e-6);

        let library = MaterialLibrary::parse("newmtl veil\nd 0.5\n").unwrap();
        assert_eq!(opacity(library.material("veil").unwrap()), Some(0.5));
    }

    #[test]
    fn test_library_keeps_extension_maps() {
        let text = "newmtl metal\nmap_Kd base.png\nmap_Pr rough.png\nPm 1.0\n";
        let library = MaterialLibrary::parse(text).unwrap();
        assert_eq!(library.texture_files(), vec!["base.png", "rough.png"]);
    }

    #[test]
    fn test_map_paths_skip_options() {
        assert_eq!(parse_map_path("-s 1 1 1 a.png").as_deref(), Some("a.png"));
        assert_eq!(parse_map_path("-bm 0.5 my file.png").as_deref(), Some("my file.png"));
        assert_eq!(parse_map_path("-o 0.5 b.png").as_deref(), Some("b.png"));
        assert_eq!(parse_map_path("-clamp on c.png").as_deref(), Some("c.png"));
        assert_eq!(parse_map_path("-imfchan r d.png").as_deref(), Some("d.png"));
        assert_eq!(parse_map_path("").as_deref(), None);
    }

    #[test]
    fn test_texture_files() {
        let library = MaterialLibrary::parse(SAMPLE).unwrap();
        assert_eq!(
            library.texture_files(),
            vec!["body_diffuse.png", "body normal.png", "eyes.png"]
        );
    }

    #[test]
    fn test_remove_and_flatten_maps() {
        let mut doc = MtlDocument::parse(SAMPLE);
        doc.materials[0].flatten_map_paths();
        assert!(doc.materials[0]
            .lines
            .contains(&"map_Kd -s 1 1 1 body_diffuse.png".to_string()));
        assert_eq!(doc.materials[0].remove_maps(), 2);
        assert!(doc.materials[0].maps().is_empty());
        assert_eq!(doc.materials[0].lines, vec!["Kd 0.5 0.25 1.0".to_string()]);
    }

    #[test]
    fn test_display_round_trip() {
        let doc = MtlDocument::parse(SAMPLE);
        let again = MtlDocument::parse(&doc.to_string());
        assert_eq!(doc, again);
    }
}
