use anyhow::{bail, Context, Result};
use clap::Parser;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn, LevelFilter};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::name::{Namespace, QName, ResolveResult};
use quick_xml::{NsReader, Writer};
use serde::Deserialize;
use simple_logger::SimpleLogger;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str;
use std::time::{Duration, Instant};
use time::macros::format_description;

/// Namespace of the UIMA CAS type system in XMI serializations.
const CAS_NAMESPACE: &[u8] = b"http:///uima/cas.ecore";

/// Attribute on the cas:Sofa element that holds the document text.
const SOFA_TEXT_ATTR: &str = "sofaString";

/// Auxiliary type system descriptor shipped next to the stripped files.
const TYPESYSTEM_FILE: &str = "typesystem.xml";

/// The complete stripped release ships exactly this many XMI files.
const EXPECTED_INPUT_FILES: usize = 982;

#[derive(Parser)]
#[command(name = "XMI Review Text Refill")]
#[command(
    about = "Fill the review texts back into the stripped XMI annotation files by matching them against the McAuley review dataset"
)]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(short, long, help = "Directory containing the stripped .xmi files", required = true)]
    input: PathBuf,

    #[arg(short, long, help = "Path to the McAuley review dataset (*.json.gz)", required = true)]
    dataset: PathBuf,

    #[arg(short, long, help = "Output directory for the refilled .xmi files", required = true)]
    output: PathBuf,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

/// One record of the line-delimited review dataset. Only the fields needed to
/// rebuild the composite file key and the review text are deserialized.
#[derive(Debug, Deserialize)]
struct Review {
    asin: String,
    #[serde(rename = "reviewerID")]
    reviewer_id: String,
    #[serde(rename = "unixReviewTime")]
    unix_review_time: i64,
    #[serde(default)]
    summary: String,
    #[serde(rename = "reviewText", default)]
    review_text: String,
}

impl Review {
    /// Each stripped XMI file is named `asin_reviewerID_unixReviewTime.xmi`.
    fn xmi_filename(&self) -> String {
        format!("{}_{}_{}.xmi", self.asin, self.reviewer_id, self.unix_review_time)
    }
}

/// Index over the input directory: the full set of expected XMI filenames plus
/// the set of product ids they encode, used as a cheap pre-filter so that most
/// dataset records are rejected without building a filename.
#[derive(Debug, Default)]
struct StrippedCorpus {
    filenames: HashSet<String>,
    asins: HashSet<String>,
}

#[derive(Debug, Default)]
struct RefillStats {
    records_seen: usize,
    matched: usize,
    unmatched: usize,
    parse_errors: usize,
}

fn scan_input_dir(input_dir: &Path) -> Result<StrippedCorpus> {
    if !input_dir.is_dir() {
        bail!(
            "Input directory does not exist: {} (expected the stripped XMI files there)",
            input_dir.display()
        );
    }

    let mut corpus = StrippedCorpus::default();
    let entries = fs::read_dir(input_dir)
        .with_context(|| format!("Failed to read input directory: {}", input_dir.display()))?;

    for entry in entries {
        let entry = entry
            .with_context(|| format!("Failed to read entry in: {}", input_dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".xmi") {
            continue;
        }
        if let Some((asin, _)) = name.split_once('_') {
            corpus.asins.insert(asin.to_string());
        }
        corpus.filenames.insert(name.to_string());
    }

    info!("Found {} input review files to add the review text to.", corpus.filenames.len());
    if corpus.filenames.len() != EXPECTED_INPUT_FILES {
        warn!(
            "You are using {} xmi files as input, the complete dataset would have {}.",
            corpus.filenames.len(),
            EXPECTED_INPUT_FILES
        );
    }

    Ok(corpus)
}

/// Joins summary and body with a blank line and decodes HTML entities, the
/// same composition the annotation pipeline used when the text was stripped.
fn compose_review_text(summary: &str, body: &str) -> String {
    let combined = format!("{}\n\n{}", summary, body);
    html_escape::decode_html_entities(&combined).into_owned()
}

fn is_cas_sofa(ns: &ResolveResult, elem: &BytesStart) -> bool {
    matches!(ns, ResolveResult::Bound(Namespace(n)) if *n == CAS_NAMESPACE)
        && elem.local_name().as_ref() == b"Sofa"
}

/// Rebuilds the cas:Sofa start tag with `sofaString` set to the review text.
/// All other attributes pass through with their original escaping.
fn patch_sofa_element(elem: &BytesStart, review_text: &str) -> Result<BytesStart<'static>> {
    let tag_name = str::from_utf8(elem.name().as_ref())
        .context("cas:Sofa tag name is not valid UTF-8")?
        .to_string();

    let mut patched = BytesStart::new(tag_name);
    for attr in elem.attributes() {
        let attr = attr.context("Malformed attribute on the cas:Sofa element")?;
        if attr.key.as_ref() != SOFA_TEXT_ATTR.as_bytes() {
            patched.push_attribute(attr);
        }
    }

    // Newlines separate summary from body and must survive a re-parse, so
    // they are written as character references instead of literal whitespace.
    let escaped = quick_xml::escape::escape(review_text)
        .replace('\r', "&#13;")
        .replace('\n', "&#10;")
        .replace('\t', "&#9;");
    patched.push_attribute(Attribute {
        key: QName(SOFA_TEXT_ATTR.as_bytes()),
        value: Cow::Owned(escaped.into_bytes()),
    });

    Ok(patched)
}

/// Streams one XMI document, replacing the `sofaString` attribute on the
/// cas:Sofa element and passing everything else through untouched. Replacing
/// an already filled attribute yields the same result, so re-runs over a
/// previous output directory are safe.
fn refill_sofa_text(xml: &[u8], review_text: &str) -> Result<Vec<u8>> {
    let mut reader = NsReader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + review_text.len()));
    let mut buf = Vec::new();
    let mut patched = false;
    let mut first_event = true;

    loop {
        let (ns, event) = reader
            .read_resolved_event_into(&mut buf)
            .context("Failed to parse XMI document")?;

        if first_event {
            first_event = false;
            if !matches!(event, Event::Decl(_)) {
                writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
            }
        }

        match event {
            Event::Eof => break,
            Event::Start(ref e) if is_cas_sofa(&ns, e) => {
                writer.write_event(Event::Start(patch_sofa_element(e, review_text)?))?;
                patched = true;
            }
            Event::Empty(ref e) if is_cas_sofa(&ns, e) => {
                writer.write_event(Event::Empty(patch_sofa_element(e, review_text)?))?;
                patched = true;
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    if !patched {
        bail!("The element 'cas:Sofa' could not be found in the xmi input files. Please check that you are using the correct files.");
    }

    Ok(writer.into_inner())
}

/// Streams the gzip-compressed dataset line by line, patching and writing
/// every XMI file whose composite key matches a record. Returns the counters
/// plus the input files that never received a matching record.
fn process_dataset(
    dataset: &Path,
    input_dir: &Path,
    output_dir: &Path,
    corpus: &StrippedCorpus,
) -> Result<(RefillStats, Vec<String>)> {
    let file = File::open(dataset)
        .with_context(|| format!("Failed to open review dataset: {}", dataset.display()))?;
    let compressed_size = file
        .metadata()
        .with_context(|| format!("Failed to stat review dataset: {}", dataset.display()))?
        .len();

    let pb = ProgressBar::new(compressed_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Reading [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let reader = BufReader::new(GzDecoder::new(pb.wrap_read(file)));

    let mut stats = RefillStats::default();
    let mut remaining: HashSet<&str> = corpus.filenames.iter().map(String::as_str).collect();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result.with_context(|| {
            format!("Error reading line {} from {}", line_num + 1, dataset.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let review: Review = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                stats.parse_errors += 1;
                warn!(
                    "Error parsing JSON from {}:{}: {}",
                    dataset.display(),
                    line_num + 1,
                    e
                );
                continue;
            }
        };
        stats.records_seen += 1;

        // Check if the review was annotated at all before building the key.
        if !corpus.asins.contains(review.asin.as_str()) {
            stats.unmatched += 1;
            continue;
        }
        let filename = review.xmi_filename();
        if !corpus.filenames.contains(&filename) {
            stats.unmatched += 1;
            continue;
        }

        let input_path = input_dir.join(&filename);
        let xml = fs::read(&input_path)
            .with_context(|| format!("Failed to read XMI file: {}", input_path.display()))?;

        let review_text = compose_review_text(&review.summary, &review.review_text);
        let refilled = refill_sofa_text(&xml, &review_text)
            .with_context(|| format!("Failed to refill: {}", input_path.display()))?;

        let output_path = output_dir.join(&filename);
        fs::write(&output_path, refilled)
            .with_context(|| format!("Failed to write XMI file: {}", output_path.display()))?;

        stats.matched += 1;
        remaining.remove(filename.as_str());
        pb.set_message(format!(
            "{}/{} reviews refilled",
            stats.matched,
            corpus.filenames.len()
        ));
        debug!("Added review text to {}", filename);
    }

    pb.finish_with_message(format!(
        "Dataset scan complete, {}/{} reviews refilled.",
        stats.matched,
        corpus.filenames.len()
    ));

    let mut unmatched_inputs: Vec<String> = remaining.into_iter().map(str::to_string).collect();
    unmatched_inputs.sort();

    Ok((stats, unmatched_inputs))
}

fn copy_typesystem(input_dir: &Path, output_dir: &Path) -> Result<()> {
    let source = input_dir.join(TYPESYSTEM_FILE);
    let target = output_dir.join(TYPESYSTEM_FILE);
    fs::copy(&source, &target).with_context(|| {
        format!(
            "Failed to copy {} from {} to {}",
            TYPESYSTEM_FILE,
            input_dir.display(),
            output_dir.display()
        )
    })?;
    info!("Copied {} to the output directory.", TYPESYSTEM_FILE);
    Ok(())
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn setup_logging(log_level_str: &str) -> Result<()> {
    let log_level = match log_level_str.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", other);
            LevelFilter::Info
        }
    };

    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    Ok(())
}

fn print_final_summary(
    start_time: Instant,
    corpus: &StrippedCorpus,
    stats: &RefillStats,
    unmatched_inputs: &[String],
    cli: &Cli,
) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Input XMI files found: {}", corpus.filenames.len());
    info!("Dataset records scanned: {}", stats.records_seen);
    info!("Reviews matched and refilled: {}", stats.matched);
    info!("Dataset records without a matching XMI file: {}", stats.unmatched);
    if stats.parse_errors > 0 {
        warn!("Dataset lines skipped due to parse errors: {}", stats.parse_errors);
    }

    if !unmatched_inputs.is_empty() {
        warn!(
            "{} input files never received a review text (dataset truncated or mismatched?):",
            unmatched_inputs.len()
        );
        for filename in unmatched_inputs.iter().take(10) {
            warn!("  - {}", filename);
        }
        if unmatched_inputs.len() > 10 {
            warn!("  ... (and {} more)", unmatched_inputs.len() - 10);
        }
    }

    info!("Output written to: {}", cli.output.display());
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    info!("Starting XMI review text refill");

    if !cli.output.is_dir() {
        fs::create_dir_all(&cli.output).with_context(|| {
            format!("Failed to create output directory: {}", cli.output.display())
        })?;
        info!("Created output directory: {}", cli.output.display());
    }

    let corpus = scan_input_dir(&cli.input)?;

    if !cli.dataset.is_file() {
        bail!(
            "The McAuley dataset file ('*.json.gz') could not be found: {}. Please check your arguments.",
            cli.dataset.display()
        );
    }

    let (stats, unmatched_inputs) =
        process_dataset(&cli.dataset, &cli.input, &cli.output, &corpus)?;

    copy_typesystem(&cli.input, &cli.output)?;

    print_final_summary(start_time, &corpus, &stats, &unmatched_inputs, &cli);
    info!("Done! - Added review texts to {} reviews.", stats.matched);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XMI: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        r#"<xmi:XMI xmlns:xmi="http://www.omg.org/XMI" xmlns:cas="http:///uima/cas.ecore" xmi:version="2.0">"#,
        r#"<cas:Sofa xmi:id="6" sofaNum="1" sofaID="_InitialView" mimeType="text" sofaString=""/>"#,
        r#"<cas:View sofa="6" members="12 18"/>"#,
        r#"</xmi:XMI>"#
    );

    #[test]
    fn compose_joins_summary_and_body_with_blank_line() {
        assert_eq!(compose_review_text("Great", "Works well."), "Great\n\nWorks well.");
    }

    #[test]
    fn compose_decodes_html_entities() {
        assert_eq!(
            compose_review_text("Cheap &amp; cheerful", "5&#39;10&quot; tall"),
            "Cheap & cheerful\n\n5'10\" tall"
        );
    }

    #[test]
    fn review_key_reconstructs_xmi_filename() {
        let review = Review {
            asin: "B00ABC".to_string(),
            reviewer_id: "A1XYZ".to_string(),
            unix_review_time: 1375142400,
            summary: String::new(),
            review_text: String::new(),
        };
        assert_eq!(review.xmi_filename(), "B00ABC_A1XYZ_1375142400.xmi");
    }

    #[test]
    fn review_deserializes_without_text_fields() {
        let review: Review =
            serde_json::from_str(r#"{"asin":"B00ABC","reviewerID":"A1XYZ","unixReviewTime":1}"#)
                .expect("deserialize");
        assert_eq!(review.summary, "");
        assert_eq!(review.review_text, "");
    }

    #[test]
    fn refill_sets_sofa_string_and_keeps_other_attributes() {
        let out = refill_sofa_text(SAMPLE_XMI.as_bytes(), "Great\n\nWorks & lasts").expect("refill");
        let out = String::from_utf8(out).expect("utf8 output");
        assert!(out.contains(r#"sofaString="Great&#10;&#10;Works &amp; lasts""#), "got: {out}");
        assert!(out.contains(r#"sofaID="_InitialView""#));
        assert!(out.contains(r#"mimeType="text""#));
        assert!(out.contains(r#"<cas:View sofa="6" members="12 18"/>"#));
        assert!(out.starts_with("<?xml"));
    }

    #[test]
    fn refill_replaces_an_existing_sofa_string() {
        let first = refill_sofa_text(SAMPLE_XMI.as_bytes(), "old text").expect("first refill");
        let second = refill_sofa_text(&first, "new text").expect("second refill");
        let second = String::from_utf8(second).expect("utf8 output");
        assert!(second.contains(r#"sofaString="new text""#));
        assert!(!second.contains("old text"));
    }

    #[test]
    fn refilled_text_survives_a_reparse() {
        let text = "Title line\n\nBody with \"quotes\" & <brackets>";
        let out = refill_sofa_text(SAMPLE_XMI.as_bytes(), text).expect("refill");

        let mut reader = NsReader::from_reader(out.as_slice());
        let mut buf = Vec::new();
        let mut roundtripped = None;
        loop {
            let (ns, event) = reader.read_resolved_event_into(&mut buf).expect("reparse");
            match event {
                Event::Eof => break,
                Event::Empty(ref e) | Event::Start(ref e) if is_cas_sofa(&ns, e) => {
                    for attr in e.attributes() {
                        let attr = attr.expect("attribute");
                        if attr.key.as_ref() == SOFA_TEXT_ATTR.as_bytes() {
                            roundtripped =
                                Some(attr.unescape_value().expect("unescape").into_owned());
                        }
                    }
                }
                _ => {}
            }
            buf.clear();
        }
        assert_eq!(roundtripped.as_deref(), Some(text));
    }

    #[test]
    fn refill_adds_xml_declaration_when_missing() {
        let without_decl = SAMPLE_XMI.trim_start_matches(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        let out = refill_sofa_text(without_decl.as_bytes(), "text").expect("refill");
        let out = String::from_utf8(out).expect("utf8 output");
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    }

    #[test]
    fn refill_fails_without_a_cas_sofa_element() {
        let xml = r#"<?xml version="1.0"?><xmi:XMI xmlns:xmi="http://www.omg.org/XMI"/>"#;
        let err = refill_sofa_text(xml.as_bytes(), "text").expect_err("should fail");
        assert!(err.to_string().contains("cas:Sofa"));
    }

    #[test]
    fn refill_ignores_sofa_elements_from_other_namespaces() {
        let xml = r#"<root xmlns:other="http://example.org"><other:Sofa sofaString=""/></root>"#;
        assert!(refill_sofa_text(xml.as_bytes(), "text").is_err());
    }

    #[test]
    fn scan_collects_xmi_filenames_and_asins() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["B001_A1_10.xmi", "B001_A2_20.xmi", "B002_A3_30.xmi"] {
            fs::write(tmp.path().join(name), "").expect("write xmi");
        }
        fs::write(tmp.path().join("typesystem.xml"), "").expect("write typesystem");
        fs::write(tmp.path().join("notes.txt"), "").expect("write notes");

        let corpus = scan_input_dir(tmp.path()).expect("scan");
        assert_eq!(corpus.filenames.len(), 3);
        assert!(corpus.filenames.contains("B001_A2_20.xmi"));
        assert_eq!(corpus.asins.len(), 2);
        assert!(corpus.asins.contains("B001"));
        assert!(corpus.asins.contains("B002"));
    }

    #[test]
    fn scan_fails_for_a_missing_directory() {
        let err = scan_input_dir(Path::new("/nonexistent/xmi-input")).expect_err("should fail");
        assert!(err.to_string().contains("Input directory does not exist"));
    }
}
