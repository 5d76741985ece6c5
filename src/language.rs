//! Language dispatch table.
//!
//! Maps a language tag to the source-file suffix and the build/run recipe.
//! Recipes are argv templates; nothing here is ever handed to a shell.

use crate::error::{ExecError, Result};
use std::path::Path;

/// Base name of the source file written into every workspace.
pub const SOURCE_STEM: &str = "code";

const SOURCE: &str = "{source}";
const WORKDIR: &str = "{workdir}";

/// How a language is built and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Interpreter invoked directly on the source file.
    Interpret(&'static [&'static str]),
    /// Compile step, then run the produced program if compilation succeeded.
    CompileThenRun {
        compile: &'static [&'static str],
        run: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub tag: &'static str,
    pub suffix: &'static str,
    pub pipeline: Pipeline,
}

pub static LANGUAGES: &[Language] = &[
    Language {
        tag: "py",
        suffix: "py",
        pipeline: Pipeline::Interpret(&["python3", SOURCE]),
    },
    Language {
        tag: "js",
        suffix: "js",
        pipeline: Pipeline::Interpret(&["node", SOURCE]),
    },
    Language {
        tag: "ts",
        suffix: "ts",
        pipeline: Pipeline::CompileThenRun {
            compile: &["npx", "tsc", SOURCE],
            run: &["node", "code.js"],
        },
    },
    Language {
        tag: "c",
        suffix: "c",
        pipeline: Pipeline::CompileThenRun {
            compile: &["gcc", SOURCE, "-o", "program"],
            run: &["{workdir}/program"],
        },
    },
    Language {
        tag: "cpp",
        suffix: "cpp",
        pipeline: Pipeline::CompileThenRun {
            compile: &["g++", SOURCE, "-o", "program"],
            run: &["{workdir}/program"],
        },
    },
    Language {
        tag: "java",
        suffix: "java",
        pipeline: Pipeline::CompileThenRun {
            compile: &["javac", SOURCE],
            run: &["java", "-cp", ".", SOURCE_STEM],
        },
    },
    Language {
        tag: "php",
        suffix: "php",
        pipeline: Pipeline::Interpret(&["php", SOURCE]),
    },
    Language {
        tag: "go",
        suffix: "go",
        pipeline: Pipeline::Interpret(&["go", "run", SOURCE]),
    },
    Language {
        tag: "r",
        suffix: "R",
        pipeline: Pipeline::Interpret(&["Rscript", SOURCE]),
    },
    Language {
        tag: "rs",
        suffix: "rs",
        pipeline: Pipeline::CompileThenRun {
            compile: &["rustc", SOURCE, "-o", "program"],
            run: &["{workdir}/program"],
        },
    },
    Language {
        tag: "d",
        suffix: "d",
        pipeline: Pipeline::CompileThenRun {
            compile: &["dmd", SOURCE, "-ofprogram"],
            run: &["{workdir}/program"],
        },
    },
    Language {
        tag: "f90",
        suffix: "f90",
        pipeline: Pipeline::CompileThenRun {
            compile: &["gfortran", SOURCE, "-o", "program"],
            run: &["{workdir}/program"],
        },
    },
];

/// Look up a language by tag.
pub fn lookup(tag: &str) -> Result<&'static Language> {
    LANGUAGES
        .iter()
        .find(|lang| lang.tag == tag)
        .ok_or_else(|| ExecError::UnsupportedLanguage(tag.to_string()))
}

pub fn supported_tags() -> impl Iterator<Item = &'static str> {
    LANGUAGES.iter().map(|lang| lang.tag)
}

/// Split a caller argument string into argv words.
///
/// Quoting follows POSIX shell word rules, but the words are never
/// interpreted by a shell: `;`, `|`, `$(...)` and friends stay literal.
pub fn split_args(args: Option<&str>) -> Result<Vec<String>> {
    match args.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(raw) => shlex::split(raw)
            .ok_or_else(|| ExecError::InvalidRequest(format!("malformed args: {raw}"))),
    }
}

/// A fully resolved argv for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn from_template(template: &[&str], source: &str, workdir: &Path) -> Self {
        let workdir = workdir.to_string_lossy();
        let mut words = template
            .iter()
            .map(|word| word.replace(SOURCE, source).replace(WORKDIR, &workdir));
        let program = words.next().unwrap_or_default();
        Self {
            program,
            args: words.collect(),
        }
    }
}

/// Resolved stages for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub compile: Option<Invocation>,
    pub run: Invocation,
}

impl Language {
    pub fn source_file_name(&self) -> String {
        format!("{SOURCE_STEM}.{}", self.suffix)
    }

    /// Resolve the pipeline against a workspace. `extra_args` are appended
    /// verbatim to the final stage only.
    pub fn plan(&self, workdir: &Path, extra_args: &[String]) -> Plan {
        let source = self.source_file_name();
        let (compile, run) = match self.pipeline {
            Pipeline::Interpret(run) => (None, run),
            Pipeline::CompileThenRun { compile, run } => (
                Some(Invocation::from_template(compile, &source, workdir)),
                run,
            ),
        };
        let mut run = Invocation::from_template(run, &source, workdir);
        run.args.extend(extra_args.iter().cloned());
        Plan { compile, run }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    #[test]
    fn every_tag_is_unique_and_has_a_program() {
        let mut seen = HashSet::new();
        for lang in LANGUAGES {
            assert!(seen.insert(lang.tag), "duplicate tag {}", lang.tag);
            let plan = lang.plan(Path::new("/ws"), &[]);
            assert!(!plan.run.program.is_empty(), "{} has no run program", lang.tag);
            if let Some(compile) = &plan.compile {
                assert!(!compile.program.is_empty());
            }
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        for tag in ["", "txt", "PY", "python", "cobol"] {
            match lookup(tag) {
                Err(ExecError::UnsupportedLanguage(t)) => assert_eq!(t, tag),
                other => panic!("expected UnsupportedLanguage for {tag:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn interpreted_plan_uses_source_name() {
        let plan = lookup("py").unwrap().plan(Path::new("/ws/s1"), &[]);
        assert_eq!(plan.compile, None);
        assert_eq!(plan.run.program, "python3");
        assert_eq!(plan.run.args, vec!["code.py"]);
    }

    #[test]
    fn r_source_keeps_capital_suffix() {
        assert_eq!(lookup("r").unwrap().source_file_name(), "code.R");
    }

    #[test]
    fn compiled_plan_runs_absolute_binary() {
        let workdir = PathBuf::from("/ws/s2");
        let plan = lookup("c").unwrap().plan(&workdir, &["a".into(), "b c".into()]);
        let compile = plan.compile.unwrap();
        assert_eq!(compile.program, "gcc");
        assert_eq!(compile.args, vec!["code.c", "-o", "program"]);
        assert_eq!(plan.run.program, "/ws/s2/program");
        assert_eq!(plan.run.args, vec!["a", "b c"]);
    }

    #[test]
    fn extra_args_only_reach_the_run_stage() {
        let plan = lookup("java").unwrap().plan(Path::new("/ws"), &["--flag".into()]);
        assert_eq!(plan.compile.unwrap().args, vec!["code.java"]);
        assert_eq!(plan.run.args, vec!["-cp", ".", "code", "--flag"]);
    }

    #[test]
    fn args_are_split_without_shell_semantics() {
        assert!(split_args(None).unwrap().is_empty());
        assert!(split_args(Some("   ")).unwrap().is_empty());
        assert_eq!(
            split_args(Some("one 'two words' \"three\"")).unwrap(),
            vec!["one", "two words", "three"]
        );
        assert_eq!(
            split_args(Some("x; rm -rf / $(id)")).unwrap(),
            vec!["x;", "rm", "-rf", "/", "$(id)"]
        );
    }

    #[test]
    fn unbalanced_quotes_are_invalid() {
        assert!(matches!(
            split_args(Some("'oops")),
            Err(ExecError::InvalidRequest(_))
        ));
    }

    #[test]
    fn supported_tags_match_table() {
        let tags: Vec<_> = supported_tags().collect();
        assert_eq!(tags.len(), LANGUAGES.len());
        assert!(tags.contains(&"py"));
        assert!(tags.contains(&"f90"));
    }
}
