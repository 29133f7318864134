// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parses the Cobertura XML coverage report schema into a typed tree.
//!
//! This mirrors the element vocabulary of the Cobertura DTD (`coverage`,
//! `sources`, `packages`, `classes`, `methods`, `lines`, `conditions`) closely
//! enough that the shapes below read straight off the DTD comments, but only
//! the attributes the coverage reasoner actually consumes are kept.

use std::io::BufRead;

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

// <!ELEMENT coverage (sources?,packages)>
// <!ATTLIST coverage line-rate        CDATA #REQUIRED>
// <!ATTLIST coverage branch-rate      CDATA #REQUIRED>
// <!ATTLIST coverage lines-covered    CDATA #REQUIRED>
// <!ATTLIST coverage lines-valid      CDATA #REQUIRED>
// <!ATTLIST coverage branches-covered CDATA #REQUIRED>
// <!ATTLIST coverage branches-valid   CDATA #REQUIRED>
// <!ATTLIST coverage complexity       CDATA #REQUIRED>
// <!ATTLIST coverage version          CDATA #REQUIRED>
// <!ATTLIST coverage timestamp        CDATA #REQUIRED>
#[derive(Clone, Debug, Default)]
pub struct CoberturaCoverage {
    pub sources: Vec<Source>,
    pub packages: Vec<Package>,

    pub line_rate: f64,
    pub branch_rate: f64,
    pub timestamp: u64,
}

// <!ELEMENT source (#PCDATA)>
#[derive(Clone, Debug, Default)]
pub struct Source {
    pub path: String,
}

// <!ELEMENT package (classes)>
// <!ATTLIST package name        CDATA #REQUIRED>
// <!ATTLIST package line-rate   CDATA #REQUIRED>
// <!ATTLIST package branch-rate CDATA #REQUIRED>
#[derive(Clone, Debug, Default)]
pub struct Package {
    pub name: String,
    pub line_rate: f64,
    pub branch_rate: f64,
    pub classes: Vec<Class>,
}

// <!ELEMENT class (methods,lines)>
// <!ATTLIST class name        CDATA #REQUIRED>
// <!ATTLIST class filename    CDATA #REQUIRED>
// <!ATTLIST class line-rate   CDATA #REQUIRED>
// <!ATTLIST class branch-rate CDATA #REQUIRED>
#[derive(Clone, Debug, Default)]
pub struct Class {
    pub name: String,
    pub filename: String,
    pub line_rate: f64,
    pub branch_rate: f64,
    pub lines: Vec<Line>,
}

// <!ELEMENT line (conditions*)>
// <!ATTLIST line number CDATA #REQUIRED>
// <!ATTLIST line hits   CDATA #REQUIRED>
#[derive(Clone, Copy, Debug, Default)]
pub struct Line {
    pub number: u64,
    pub hits: u64,
}

/// Parses a Cobertura XML document, keeping only the attributes the
/// coverage reasoner consumes. Unknown elements and attributes are ignored
/// rather than rejected, since report generators vary in which optional
/// fields (conditions, complexity, methods) they emit.
pub fn parse(xml: impl BufRead) -> Result<CoberturaCoverage> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut coverage = CoberturaCoverage::default();
    let mut buf = Vec::new();

    let mut in_sources = false;
    let mut current_package: Option<Package> = None;
    let mut current_class: Option<Class> = None;
    let mut text_buf = String::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .context("malformed coverage XML")?
        {
            Event::Start(e) | Event::Empty(e) => {
                handle_start(
                    &e,
                    &mut coverage,
                    &mut in_sources,
                    &mut current_package,
                    &mut current_class,
                )?;
                if e.name().as_ref() == b"source" {
                    text_buf.clear();
                }
            }
            Event::Text(e) => {
                text_buf.push_str(&e.unescape().unwrap_or_default());
            }
            Event::End(e) => {
                handle_end(
                    &e,
                    &mut coverage,
                    &mut in_sources,
                    &mut current_package,
                    &mut current_class,
                    &mut text_buf,
                )?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(coverage)
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn attr_f64(e: &BytesStart, name: &str) -> f64 {
    attr(e, name).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

fn attr_u64(e: &BytesStart, name: &str) -> u64 {
    attr(e, name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn handle_start(
    e: &BytesStart,
    coverage: &mut CoberturaCoverage,
    in_sources: &mut bool,
    current_package: &mut Option<Package>,
    current_class: &mut Option<Class>,
) -> Result<()> {
    match e.name().as_ref() {
        b"coverage" => {
            coverage.line_rate = attr_f64(e, "line-rate");
            coverage.branch_rate = attr_f64(e, "branch-rate");
            coverage.timestamp = attr_u64(e, "timestamp");
        }
        b"sources" => *in_sources = true,
        b"package" => {
            *current_package = Some(Package {
                name: attr(e, "name").unwrap_or_default(),
                line_rate: attr_f64(e, "line-rate"),
                branch_rate: attr_f64(e, "branch-rate"),
                classes: Vec::new(),
            });
        }
        b"class" => {
            *current_class = Some(Class {
                name: attr(e, "name").unwrap_or_default(),
                filename: attr(e, "filename").unwrap_or_default(),
                line_rate: attr_f64(e, "line-rate"),
                branch_rate: attr_f64(e, "branch-rate"),
                lines: Vec::new(),
            });
        }
        b"line" => {
            let line = Line {
                number: attr_u64(e, "number"),
                hits: attr_u64(e, "hits"),
            };
            if let Some(class) = current_class.as_mut() {
                class.lines.push(line);
            }
        }
        _ => {}
    }
    let _ = in_sources;
    Ok(())
}

fn handle_end(
    e: &quick_xml::events::BytesEnd,
    coverage: &mut CoberturaCoverage,
    in_sources: &mut bool,
    current_package: &mut Option<Package>,
    current_class: &mut Option<Class>,
    text_buf: &mut String,
) -> Result<()> {
    match e.name().as_ref() {
        b"sources" => *in_sources = false,
        b"source" => {
            coverage.sources.push(Source {
                path: text_buf.trim().to_string(),
            });
            text_buf.clear();
        }
        b"class" => {
            if let Some(class) = current_class.take() {
                if let Some(package) = current_package.as_mut() {
                    package.classes.push(class);
                }
            }
        }
        b"package" => {
            if let Some(package) = current_package.take() {
                coverage.packages.push(package);
            }
        }
        _ => {}
    }
    Ok(())
}

impl CoberturaCoverage {
    /// Flattens every `packages[*].classes[*]` into one list, the shape the
    /// coverage reasoner actually iterates over.
    pub fn all_classes(&self) -> impl Iterator<Item = &Class> {
        self.packages.iter().flat_map(|p| p.classes.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<coverage line-rate="0.82" branch-rate="0.5" timestamp="1700000000">
  <sources>
    <source>/repo/src</source>
  </sources>
  <packages>
    <package name="main" line-rate="0.82" branch-rate="0.5">
      <classes>
        <class name="lib" filename="lib/util.py" line-rate="0.82" branch-rate="0.5">
          <lines>
            <line number="1" hits="1"/>
            <line number="2" hits="0"/>
          </lines>
        </class>
      </classes>
    </package>
  </packages>
</coverage>"#;

    #[test]
    fn parses_sources_and_classes() {
        let coverage = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(coverage.sources.len(), 1);
        assert_eq!(coverage.sources[0].path, "/repo/src");
        assert_eq!(coverage.timestamp, 1700000000);

        let classes: Vec<_> = coverage.all_classes().collect();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].filename, "lib/util.py");
        assert_eq!(classes[0].lines.len(), 2);
        assert_eq!(classes[0].lines[0].hits, 1);
        assert_eq!(classes[0].lines[1].hits, 0);
    }

    #[test]
    fn empty_coverage_has_no_classes() {
        let coverage = parse(
            r#"<coverage line-rate="0" branch-rate="0" timestamp="0"><packages/></coverage>"#
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(coverage.all_classes().count(), 0);
    }
}
