//! Pipeline stage identities and command templates.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{HarvestError, HarvestResult};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the source package into the build directory.
    Fetch,

    /// Configure and compile the package.
    Build,

    /// Extract debug symbols for each built artifact.
    DebugSymbols,

    /// Run the type-extraction tool for each artifact.
    ExtractTypes,

    /// Copy generated type libraries to the output directory.
    Collect,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Build,
        Stage::DebugSymbols,
        Stage::ExtractTypes,
        Stage::Collect,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Build => "build",
            Stage::DebugSymbols => "extract_debug_symbols",
            Stage::ExtractTypes => "extract_types",
            Stage::Collect => "collect",
        }
    }

    /// Whether a failure of this stage as a whole aborts the pipeline.
    ///
    /// Per-file failures inside post-processing stages never do.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Stage::DebugSymbols | Stage::ExtractTypes)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placeholder names understood by [`CommandTemplate::render`].
pub const PLACEHOLDERS: &[&str] = &[
    "package",
    "build_dir",
    "file",
    "file_name",
    "file_stem",
    "dwarf_file",
    "type_library",
];

/// Values substituted into `{placeholder}` markers of a [`CommandTemplate`].
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub package: Option<String>,
    pub build_dir: Option<PathBuf>,
    pub file: Option<PathBuf>,
    pub dwarf_file: Option<PathBuf>,
    pub type_library: Option<PathBuf>,
}

impl TemplateContext {
    pub fn for_package(package: &str, build_dir: &Path) -> Self {
        Self {
            package: Some(package.to_string()),
            build_dir: Some(build_dir.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: &Path) -> Self {
        self.file = Some(file.to_path_buf());
        self
    }

    pub fn with_dwarf_file(mut self, dwarf_file: &Path) -> Self {
        self.dwarf_file = Some(dwarf_file.to_path_buf());
        self
    }

    pub fn with_type_library(mut self, type_library: &Path) -> Self {
        self.type_library = Some(type_library.to_path_buf());
        self
    }

    fn lookup(&self, key: &str) -> HarvestResult<String> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().to_string());
        let value = match key {
            "package" => self.package.clone(),
            "build_dir" => path(&self.build_dir),
            "file" => path(&self.file),
            "file_name" => self
                .file
                .as_ref()
                .and_then(|f| f.file_name())
                .map(|n| n.to_string_lossy().to_string()),
            "file_stem" => self
                .file
                .as_ref()
                .and_then(|f| f.file_stem())
                .map(|n| n.to_string_lossy().to_string()),
            "dwarf_file" => path(&self.dwarf_file),
            "type_library" => path(&self.type_library),
            other => {
                return Err(HarvestError::InvalidTemplate(format!(
                    "unknown placeholder {{{}}}",
                    other
                )))
            }
        };
        value.ok_or_else(|| {
            HarvestError::InvalidTemplate(format!("placeholder {{{}}} has no value here", key))
        })
    }
}

/// A program plus argument templates, configured per stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Executable name or path.
    pub program: String,

    /// Arguments; `{name}` markers are substituted at render time.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Materialise a [`Command`] running in `working_directory`.
    pub fn render(
        &self,
        ctx: &TemplateContext,
        working_directory: &Path,
    ) -> HarvestResult<Command> {
        if self.program.trim().is_empty() {
            return Err(HarvestError::InvalidTemplate("empty program".to_string()));
        }
        let program = substitute(&self.program, ctx)?;
        let args = self
            .args
            .iter()
            .map(|a| substitute(a, ctx))
            .collect::<HarvestResult<Vec<_>>>()?;
        Ok(Command::new(program, working_directory).args(args))
    }

    /// Placeholder names used anywhere in this template.
    pub fn placeholders(&self) -> HarvestResult<Vec<String>> {
        let mut names = Vec::new();
        for part in std::iter::once(&self.program).chain(self.args.iter()) {
            scan(part, |name| {
                names.push(name.to_string());
                Ok(String::new())
            })?;
        }
        Ok(names)
    }
}

fn substitute(input: &str, ctx: &TemplateContext) -> HarvestResult<String> {
    scan(input, |name| ctx.lookup(name))
}

/// Walk `input`, replacing each `{name}` with `replace(name)`.
/// `{{` and `}}` produce literal braces.
fn scan<F>(input: &str, mut replace: F) -> HarvestResult<String>
where
    F: FnMut(&str) -> HarvestResult<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &input[i + 1..];
                let end = rest.find('}').ok_or_else(|| {
                    HarvestError::InvalidTemplate(format!("unclosed placeholder in '{}'", input))
                })?;
                out.push_str(&replace(&rest[..end])?);
                let close = i + 1 + end;
                while chars.next_if(|(j, _)| *j <= close).is_some() {}
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Fetch.name(), "fetch");
        assert_eq!(Stage::Build.name(), "build");
        assert_eq!(Stage::DebugSymbols.name(), "extract_debug_symbols");
        assert_eq!(Stage::ExtractTypes.name(), "extract_types");
        assert_eq!(Stage::Collect.name(), "collect");
    }

    #[test]
    fn test_per_file_stages() {
        assert!(!Stage::Fetch.is_per_file());
        assert!(!Stage::Build.is_per_file());
        assert!(Stage::DebugSymbols.is_per_file());
        assert!(Stage::ExtractTypes.is_per_file());
        assert!(!Stage::Collect.is_per_file());
    }

    #[test]
    fn test_render_package_template() {
        let template = CommandTemplate::new(
            "brew",
            ["unpack", "--destdir", "{build_dir}", "{package}"],
        );
        let ctx = TemplateContext::for_package("zlib", Path::new("/work"));
        let cmd = template.render(&ctx, Path::new("/work")).unwrap();
        assert_eq!(cmd.program(), "brew");
        assert_eq!(cmd.arguments(), ["unpack", "--destdir", "/work", "zlib"]);
        assert_eq!(cmd.working_directory(), Path::new("/work"));
    }

    #[test]
    fn test_render_file_template() {
        let template = CommandTemplate::new(
            "extract",
            ["{file}", "--name={file_name}", "--stem={file_stem}", "--out", "{type_library}"],
        );
        let ctx = TemplateContext::for_package("zlib", Path::new("/work"))
            .with_file(Path::new("/work/lib/libz.dylib"))
            .with_type_library(Path::new("/work/lib/libz.bntl"));
        let cmd = template.render(&ctx, Path::new("/work")).unwrap();
        assert_eq!(
            cmd.arguments(),
            [
                "/work/lib/libz.dylib",
                "--name=libz.dylib",
                "--stem=libz",
                "--out",
                "/work/lib/libz.bntl"
            ]
        );
    }

    #[test]
    fn test_literal_braces() {
        let template = CommandTemplate::new("sh", ["-c", "echo {{}} {package}"]);
        let ctx = TemplateContext::for_package("zlib", Path::new("/work"));
        let cmd = template.render(&ctx, Path::new("/work")).unwrap();
        assert_eq!(cmd.arguments(), ["-c", "echo {} zlib"]);
    }

    #[test]
    fn test_unknown_placeholder_is_rejected() {
        let template = CommandTemplate::new("tool", ["{nope}"]);
        let ctx = TemplateContext::for_package("zlib", Path::new("/work"));
        let err = template.render(&ctx, Path::new("/work")).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidTemplate(_)));
    }

    #[test]
    fn test_missing_value_is_rejected() {
        let template = CommandTemplate::new("dsymutil", ["{file}"]);
        let ctx = TemplateContext::for_package("zlib", Path::new("/work"));
        assert!(template.render(&ctx, Path::new("/work")).is_err());
    }

    #[test]
    fn test_unclosed_placeholder_is_rejected() {
        let template = CommandTemplate::new("tool", ["{file"]);
        let ctx = TemplateContext::default();
        assert!(template.render(&ctx, Path::new("/")).is_err());
    }

    #[test]
    fn test_placeholders_listing() {
        let template = CommandTemplate::new("{package}-tool", ["{file}", "x", "{{lit}}"]);
        assert_eq!(template.placeholders().unwrap(), vec!["package", "file"]);
    }
}
