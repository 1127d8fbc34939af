use std::collections::HashMap;

/// One entry in the abbreviation registry: a Spanish sigla or a known EU
/// acronym mapped to its canonical law name and, where known ahead of
/// validation, its registry id.
#[derive(Debug, Clone)]
pub struct AbbreviationEntry {
    pub canonical_name: String,
    pub registry_id: Option<String>,
    pub is_eu: bool,
}

/// Static mapping sigla -> canonical name / registry id. Loaded once at
/// startup and read-only thereafter (the only process-wide mutable state
/// besides the on-disk caches lives in `registry`, not here).
#[derive(Debug, Clone)]
pub struct AbbreviationRegistry {
    entries: HashMap<String, AbbreviationEntry>,
}

impl AbbreviationRegistry {
    /// Seed data ported from the source convergence engine's sigla map,
    /// plus the EU acronyms named in the normalizer's design notes.
    pub fn with_builtin_seed() -> Self {
        let mut entries = HashMap::new();

        let spanish: &[(&str, &str, Option<&str>)] = &[
            ("CE", "constitución española", Some("BOE-A-1978-31229")),
            ("CC", "código civil", Some("BOE-A-1889-4763")),
            ("LEC", "ley 1/2000", Some("BOE-A-2000-323")),
            ("LPAC", "ley 39/2015", Some("BOE-A-2015-10565")),
            ("LRJSP", "ley 40/2015", Some("BOE-A-2015-10566")),
            ("LOPJ", "ley orgánica 6/1985", Some("BOE-A-1985-12666")),
            ("LJCA", "ley 29/1998", Some("BOE-A-1998-16718")),
            ("LJV", "ley 15/2015", Some("BOE-A-2015-7391")),
            ("TRET", "estatuto trabajadores", Some("BOE-A-2015-11430")),
            ("ET", "estatuto trabajadores", Some("BOE-A-2015-11430")),
            ("CP", "código penal", Some("BOE-A-1995-25444")),
            ("LECrim", "ley enjuiciamiento criminal", Some("BOE-A-1882-6036")),
            ("LOPA", "ley orgánica policía", None),
        ];
        for (sigla, canonical, registry_id) in spanish {
            entries.insert(
                sigla.to_lowercase(),
                AbbreviationEntry {
                    canonical_name: canonical.to_string(),
                    registry_id: registry_id.map(str::to_string),
                    is_eu: false,
                },
            );
        }

        let eu: &[(&str, &str)] = &[
            ("RGPD", "reglamento general de protección de datos"),
            ("eIDAS", "reglamento eidas"),
            ("Roma I", "reglamento roma i"),
            ("DSA", "reglamento de servicios digitales"),
        ];
        for (sigla, canonical) in eu {
            entries.insert(
                sigla.to_lowercase(),
                AbbreviationEntry {
                    canonical_name: canonical.to_string(),
                    registry_id: None,
                    is_eu: true,
                },
            );
        }

        Self { entries }
    }

    /// Layers extra entries from a JSON file on top of the built-in seed.
    /// Expected shape: `[{"sigla": "...", "canonical_name": "...", "registry_id": "...", "is_eu": bool}]`.
    /// Malformed entries are skipped, never fatal to startup.
    pub fn load_extra_from_file(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        let Ok(contents) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(&contents) else {
            return;
        };
        for item in items {
            let Some(sigla) = item.get("sigla").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(canonical) = item.get("canonical_name").and_then(|v| v.as_str()) else {
                continue;
            };
            self.entries.insert(
                sigla.to_lowercase(),
                AbbreviationEntry {
                    canonical_name: canonical.to_string(),
                    registry_id: item
                        .get("registry_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    is_eu: item.get("is_eu").and_then(|v| v.as_bool()).unwrap_or(false),
                },
            );
        }
    }

    pub fn lookup(&self, sigla: &str) -> Option<&AbbreviationEntry> {
        self.entries.get(&sigla.trim().to_lowercase())
    }

    pub fn all_spanish_siglas(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_eu)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Renders a short "assistance only" hint block for prompts: the
    /// caller injects this as guidance, never as ground truth the LLM
    /// should defer to blindly.
    pub fn hint_block(&self) -> String {
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|(sigla, e)| format!("{sigla} -> {}", e.canonical_name))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

impl Default for AbbreviationRegistry {
    fn default() -> Self {
        Self::with_builtin_seed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_spanish_sigla() {
        let reg = AbbreviationRegistry::with_builtin_seed();
        let e = reg.lookup("LPAC").expect("LPAC seeded");
        assert_eq!(e.canonical_name, "ley 39/2015");
        assert_eq!(e.registry_id.as_deref(), Some("BOE-A-2015-10565"));
        assert!(!e.is_eu);
    }

    #[test]
    fn resolves_known_eu_sigla_case_insensitively() {
        let reg = AbbreviationRegistry::with_builtin_seed();
        let e = reg.lookup("rgpd").expect("RGPD seeded");
        assert!(e.is_eu);
    }

    #[test]
    fn unknown_sigla_is_none() {
        let reg = AbbreviationRegistry::with_builtin_seed();
        assert!(reg.lookup("ZZZZ").is_none());
    }
}
