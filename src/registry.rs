//! Declarative build/run recipes, one per supported toolchain.

use crate::{Error, Result};
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// Where the workspace is mounted inside every sandbox.
pub const WORKSPACE_DIR: &str = "/workspace";
/// Writable tmpfs inside every sandbox; build artifacts go here.
pub const SCRATCH_DIR: &str = "/tmp";

const DEFAULT_INPUT_FILE: &str = "input.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProfile {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub image: String,
    /// Absent for interpreted languages.
    #[serde(default)]
    pub build: Option<String>,
    pub run: String,
    pub source_file: String,
    #[serde(default = "default_input_file")]
    pub input_file: String,
    #[serde(default = "default_read_only_root")]
    pub read_only_root: bool,
}

fn default_input_file() -> String {
    DEFAULT_INPUT_FILE.to_string()
}

fn default_read_only_root() -> bool {
    true
}

impl LanguageProfile {
    fn builtin(id: &str, aliases: &[&str], image: &str, build: Option<&str>, run: &str, source_file: &str) -> Self {
        LanguageProfile {
            id: id.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            image: image.to_string(),
            build: build.map(str::to_string),
            run: run.to_string(),
            source_file: source_file.to_string(),
            input_file: default_input_file(),
            read_only_root: true,
        }
    }

    pub fn source_path(&self) -> String {
        format!("{}/{}", WORKSPACE_DIR, self.source_file)
    }

    pub fn input_path(&self) -> String {
        format!("{}/{}", WORKSPACE_DIR, self.input_file)
    }

    pub fn build_command(&self) -> Option<String> {
        self.build.as_deref().map(|template| self.render(template))
    }

    /// The run command with the input file delivered on stdin.
    pub fn run_command(&self) -> String {
        format!("{} < {}", self.render(&self.run), self.input_path())
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{source}", &self.source_path())
            .replace("{input}", &self.input_path())
            .replace("{workspace}", WORKSPACE_DIR)
            .replace("{scratch}", SCRATCH_DIR)
    }

    fn validate(&self) -> Result<()> {
        let reason = if self.id.trim().is_empty() {
            Some("language id cannot be empty".to_string())
        } else if self.image.trim().is_empty() {
            Some(format!("language {} has no image", self.id))
        } else if self.run.trim().is_empty() {
            Some(format!("language {} has no run command", self.id))
        } else if !is_plain_file_name(&self.source_file) || !is_plain_file_name(&self.input_file) {
            Some(format!("language {} uses invalid file names", self.id))
        } else if self.source_file == self.input_file {
            Some(format!("language {} uses the same file for source and input", self.id))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidConfig { reason }),
            None => Ok(()),
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

lazy_static! {
    static ref BUILTIN_PROFILES: Vec<LanguageProfile> = vec![
        LanguageProfile::builtin(
            "c",
            &[],
            "gcc:13",
            Some("gcc -std=c17 -O2 -pipe -o {scratch}/solution {source} -lm"),
            "{scratch}/solution",
            "solution.c",
        ),
        LanguageProfile::builtin(
            "cpp",
            &["c++", "cxx", "cc"],
            "gcc:13",
            Some("g++ -std=c++17 -O2 -pipe -o {scratch}/solution {source}"),
            "{scratch}/solution",
            "solution.cpp",
        ),
        LanguageProfile::builtin(
            "java",
            &[],
            "eclipse-temurin:21-jdk",
            Some("javac -d {scratch} {source}"),
            "java -Xss64m -XX:+UseSerialGC -cp {scratch} Main",
            "Main.java",
        ),
        LanguageProfile::builtin(
            "python",
            &["py", "python3"],
            "python:3.12-slim",
            None,
            "python3 -B {source}",
            "solution.py",
        ),
        LanguageProfile::builtin(
            "rust",
            &["rs"],
            "rust:1-slim",
            Some("rustc --edition 2021 -O -o {scratch}/solution {source}"),
            "{scratch}/solution",
            "main.rs",
        ),
    ];
}

pub fn builtin_profiles() -> Vec<LanguageProfile> {
    BUILTIN_PROFILES.clone()
}

/// Read-only map from language identifiers and aliases to profiles.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    ids: Vec<String>,
}

impl LanguageRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_profiles(builtin_profiles())
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = LanguageProfile>) -> Result<Self> {
        let mut registry = LanguageRegistry {
            profiles: HashMap::new(),
            ids: Vec::new(),
        };

        for profile in profiles {
            profile.validate()?;
            let profile = Arc::new(profile);

            let keys = std::iter::once(&profile.id).chain(profile.aliases.iter());
            for key in keys {
                let key = key.to_lowercase();
                if registry.profiles.insert(key.clone(), Arc::clone(&profile)).is_some() {
                    return Err(Error::DuplicateLanguage { language: key });
                }
            }
            registry.ids.push(profile.id.clone());
        }

        Ok(registry)
    }

    pub fn lookup(&self, language: &str) -> Result<Arc<LanguageProfile>> {
        self.profiles
            .get(&language.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedLanguage {
                language: language.to_string(),
            })
    }

    /// Primary identifiers, in registration order.
    pub fn languages(&self) -> &[String] {
        &self.ids
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Arc<LanguageProfile>> + '_ {
        self.ids.iter().filter_map(move |id| self.profiles.get(&id.to_lowercase()))
    }
}
