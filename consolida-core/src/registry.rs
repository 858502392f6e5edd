//! Static registry mapping file-name patterns to record kinds and column layouts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::decode::{COMPANY_COLUMNS, ESTABLISHMENT_COLUMNS, PARTNER_COLUMNS, REFERENCE_COLUMNS};
use crate::model::{RecordKind, ReferenceTable};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Problems found while validating the registry at startup.
pub enum RegistryError {
    /// A pattern is blank.
    #[error("Empty file pattern for {0}")]
    EmptyPattern(RecordKind),
    /// The same pattern is declared twice.
    #[error("Duplicate file pattern `{0}`")]
    DuplicatePattern(String),
    /// One pattern contains another that maps to a different kind.
    #[error("Pattern `{first}` overlaps `{second}` with a different kind")]
    AmbiguousPattern {
        /// Earlier pattern.
        first: String,
        /// Later pattern.
        second: String,
    },
    /// A kind reachable from a pattern has no layout.
    #[error("No layout declared for {0}")]
    MissingLayout(RecordKind),
    /// Two layouts for one kind.
    #[error("Duplicate layout for {0}")]
    DuplicateLayout(RecordKind),
    /// A layout's columns do not match what its decoder consumes.
    #[error("Layout for {0} does not match its decoder")]
    LayoutMismatch(RecordKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Text encoding of a source file.
pub enum TextEncoding {
    /// ISO-8859-1, as published by the registry.
    Latin1,
    /// UTF-8.
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Column layout and framing of one record kind.
pub struct Layout {
    /// Kind described by the layout.
    pub kind: RecordKind,
    /// Column names in file order.
    pub columns: &'static [&'static str],
    /// Field delimiter.
    pub delimiter: u8,
    /// Quote character.
    pub quote: u8,
    /// Text encoding.
    pub encoding: TextEncoding,
}

impl Layout {
    /// `;`-delimited, `"`-quoted Latin-1 layout, as the registry publishes.
    #[must_use]
    pub fn registry(kind: RecordKind) -> Self {
        Self {
            kind,
            columns: expected_columns(kind),
            delimiter: b';',
            quote: b'"',
            encoding: TextEncoding::Latin1,
        }
    }
}

/// Columns the decoder of `kind` consumes.
#[must_use]
pub fn expected_columns(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Reference(_) => REFERENCE_COLUMNS,
        RecordKind::Company => COMPANY_COLUMNS,
        RecordKind::Establishment => ESTABLISHMENT_COLUMNS,
        RecordKind::Partner => PARTNER_COLUMNS,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Case-insensitive file-name fragment identifying a record kind.
pub struct FilePattern {
    /// Upper-case fragment searched in the file name.
    pub fragment: String,
    /// Kind of matching files.
    pub kind: RecordKind,
}

impl FilePattern {
    /// Build a pattern; the fragment is upper-cased.
    #[must_use]
    pub fn new(fragment: &str, kind: RecordKind) -> Self {
        Self {
            fragment: fragment.trim().to_uppercase(),
            kind,
        }
    }
}

/// Registry that resolves record kinds and layouts from file names.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    patterns: Vec<FilePattern>,
    layouts: HashMap<RecordKind, Layout>,
}

impl KindRegistry {
    /// Build and validate a registry. Patterns are tried in the given order.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] when patterns are empty, duplicated, or
    /// ambiguous, or when a kind lacks a layout matching its decoder.
    pub fn new(patterns: Vec<FilePattern>, layouts: Vec<Layout>) -> Result<Self, RegistryError> {
        let mut by_kind = HashMap::new();
        for layout in layouts {
            if layout.columns != expected_columns(layout.kind) {
                return Err(RegistryError::LayoutMismatch(layout.kind));
            }
            let kind = layout.kind;
            if by_kind.insert(kind, layout).is_some() {
                return Err(RegistryError::DuplicateLayout(kind));
            }
        }

        for (position, pattern) in patterns.iter().enumerate() {
            if pattern.fragment.is_empty() {
                return Err(RegistryError::EmptyPattern(pattern.kind));
            }
            if !by_kind.contains_key(&pattern.kind) {
                return Err(RegistryError::MissingLayout(pattern.kind));
            }
            for earlier in patterns.iter().take(position) {
                if earlier.fragment == pattern.fragment {
                    return Err(RegistryError::DuplicatePattern(pattern.fragment.clone()));
                }
                let overlaps = earlier.fragment.contains(&pattern.fragment)
                    || pattern.fragment.contains(&earlier.fragment);
                if overlaps && earlier.kind != pattern.kind {
                    return Err(RegistryError::AmbiguousPattern {
                        first: earlier.fragment.clone(),
                        second: pattern.fragment.clone(),
                    });
                }
            }
        }

        Ok(Self {
            patterns,
            layouts: by_kind,
        })
    }

    /// Registry for the federal revenue CNPJ open-data extracts.
    ///
    /// Exact extract suffixes come first, then looser fragments seen in
    /// renamed or re-packaged files.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the built-in table is inconsistent.
    pub fn standard() -> Result<Self, RegistryError> {
        use RecordKind::{Company, Establishment, Partner, Reference};
        use ReferenceTable::{
            Cnae, Country, LegalNature, Municipality, PartnerQualification, StatusReason,
        };

        let table = [
            ("EMPRECSV", Company),
            ("ESTABLELE", Establishment),
            ("ESTABELE", Establishment),
            ("ESTABEL", Establishment),
            ("SOCIOCSV", Partner),
            ("CNAECSV", Reference(Cnae)),
            ("MUNICCSV", Reference(Municipality)),
            ("NATJUCSV", Reference(LegalNature)),
            ("PAISCSV", Reference(Country)),
            ("QUALSCSV", Reference(PartnerQualification)),
            ("MOTICSV", Reference(StatusReason)),
            ("EMPRE", Company),
            ("ESTAB", Establishment),
            ("FILIAIS", Establishment),
            ("FILIAL", Establishment),
            ("SOCIO", Partner),
            ("CNAE", Reference(Cnae)),
            ("MUNIC", Reference(Municipality)),
            ("NATJ", Reference(LegalNature)),
            ("PAIS", Reference(Country)),
            ("QUAL", Reference(PartnerQualification)),
            ("MOTI", Reference(StatusReason)),
        ];
        let patterns = table
            .iter()
            .map(|(fragment, kind)| FilePattern::new(fragment, *kind))
            .collect();

        let layouts = [Company, Establishment, Partner]
            .into_iter()
            .chain(ReferenceTable::ALL.into_iter().map(Reference))
            .map(Layout::registry)
            .collect();

        Self::new(patterns, layouts)
    }

    /// Kind of a file, or `None` when no pattern matches.
    #[must_use]
    pub fn classify(&self, file_name: &str) -> Option<RecordKind> {
        let upper = file_name.to_uppercase();
        self.patterns
            .iter()
            .find(|pattern| upper.contains(&pattern.fragment))
            .map(|pattern| pattern.kind)
    }

    /// Look up the layout of a kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MissingLayout`] when none is registered.
    pub fn layout(&self, kind: RecordKind) -> Result<&Layout, RegistryError> {
        self.layouts
            .get(&kind)
            .ok_or(RegistryError::MissingLayout(kind))
    }
}
