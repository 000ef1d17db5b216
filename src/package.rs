//! In-place editing of an xlsx package.
//!
//! Saving copies the template's zip package part by part and rewrites only
//! what changed: the touched cells of each worksheet, new cell styles, and the
//! workbook parts that list sheets when a sheet is added. Styling of untouched
//! cells, column widths, merged ranges and cached formula results pass through
//! as they were.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::iter::Peekable;
use std::slice;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{PosmapError, Result};
use crate::workbook::{Cell, CellValue};

const WORKSHEET_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
const WORKSHEET_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
const EMPTY_WORKSHEET: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    "\n",
    r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" "#,
    r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
    r#"<sheetViews><sheetView workbookViewId="0"/></sheetViews><sheetData/></worksheet>"#
);
/// First id Excel leaves free for custom number formats.
const FIRST_CUSTOM_NUM_FMT: u32 = 164;

/// Changes to one worksheet, in workbook order.
#[derive(Debug)]
pub struct SheetEdit<'a> {
    pub name: &'a str,
    /// Touched cells in (row, col) order. `None` clears the value but keeps
    /// the cell's style.
    pub cells: Vec<((u32, u16), Option<&'a Cell>)>,
    /// Drop every existing row and merged range before writing `cells`.
    pub rebuild: bool,
    pub freeze_panes: Option<(u32, u16)>,
}

impl SheetEdit<'_> {
    fn is_noop(&self) -> bool {
        self.cells.is_empty() && !self.rebuild && self.freeze_panes.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    parts: Vec<(String, Vec<u8>)>,
    workbook_part: String,
    /// (sheet name, worksheet part) in workbook order.
    sheets: Vec<(String, String)>,
    /// Qualified name of the relationship id attribute on `<sheet>`.
    rel_id_attr: String,
    max_sheet_id: u32,
}

#[derive(Debug)]
struct Relationship {
    id: String,
    kind: String,
    target: String,
}

struct NewSheet {
    name: String,
    part: String,
    rel_id: String,
    sheet_id: u32,
    /// Existing sheet this one is listed before; `None` appends.
    before: Option<String>,
}

impl Package {
    pub fn open(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            parts.push((file.name().to_string(), data));
        }

        let mut package = Self {
            parts,
            workbook_part: String::new(),
            sheets: Vec::new(),
            rel_id_attr: "r:id".to_string(),
            max_sheet_id: 0,
        };
        package.workbook_part = relationships(&package.text("_rels/.rels")?, "")?
            .into_iter()
            .find(|r| r.kind.ends_with("/officeDocument"))
            .map(|r| r.target)
            .ok_or_else(|| PosmapError::Other("xlsx package has no workbook part".to_string()))?;

        let rels = package.workbook_rels()?;
        let workbook_xml = package.text(&package.workbook_part)?;
        let mut reader = Reader::from_str(&workbook_xml);
        loop {
            match reader.read_event()? {
                Event::Eof => break,
                Event::Start(e) | Event::Empty(e) if is(&e, b"sheet") => {
                    let sheet_id = attr(&e, b"sheetId").and_then(|v| v.parse().ok()).unwrap_or(0);
                    package.max_sheet_id = package.max_sheet_id.max(sheet_id);
                    let Some(rel_attr) = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"id" && a.key.prefix().is_some())
                    else {
                        continue;
                    };
                    package.rel_id_attr = String::from_utf8_lossy(rel_attr.key.as_ref()).into_owned();
                    let rel_id = rel_attr.unescape_value().map(|v| v.into_owned()).unwrap_or_default();
                    let name = attr(&e, b"name").unwrap_or_default();
                    if let Some(rel) = rels.iter().find(|r| r.id == rel_id) {
                        package.sheets.push((name, rel.target.clone()));
                    }
                }
                _ => {}
            }
        }
        Ok(package)
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheets.iter().any(|(n, _)| n == name)
    }

    fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    fn text(&self, name: &str) -> Result<String> {
        let data = self
            .part(name)
            .ok_or_else(|| PosmapError::Other(format!("xlsx part missing: {name}")))?;
        String::from_utf8(data.to_vec()).map_err(|e| PosmapError::Other(format!("{name}: {e}")))
    }

    fn workbook_rels_part(&self) -> String {
        rels_part(&self.workbook_part)
    }

    fn workbook_rels(&self) -> Result<Vec<Relationship>> {
        relationships(&self.text(&self.workbook_rels_part())?, parent_dir(&self.workbook_part))
    }

    fn free_sheet_part(&self, taken: &[NewSheet]) -> String {
        let dir = self
            .sheets
            .first()
            .map(|(_, part)| parent_dir(part).to_string())
            .unwrap_or_else(|| join(parent_dir(&self.workbook_part), "worksheets"));
        (1..)
            .map(|n| join(&dir, &format!("sheet{n}.xml")))
            .find(|p| self.part(p).is_none() && !taken.iter().any(|s| &s.part == p))
            .unwrap_or_default()
    }

    /// Serialize the package with `edits` applied. `edits` lists every sheet
    /// of the workbook in order; sheets unknown to the package are added.
    pub fn save(&self, edits: &[SheetEdit<'_>]) -> Result<Vec<u8>> {
        let rels = self.workbook_rels()?;
        let styles_part = rels
            .iter()
            .find(|r| r.kind.ends_with("/styles"))
            .map(|r| r.target.clone());
        let mut styles = match &styles_part {
            Some(part) => StyleBook::parse(&self.text(part)?)?,
            None => StyleBook::default(),
        };

        let mut replaced: HashMap<String, Vec<u8>> = HashMap::new();
        let mut added: Vec<NewSheet> = Vec::new();
        let mut added_parts: Vec<(String, Vec<u8>)> = Vec::new();
        let mut dropped_formula = false;

        let mut rel_ids: HashSet<String> = rels.iter().map(|r| r.id.clone()).collect();
        for (index, edit) in edits.iter().enumerate() {
            match self.sheets.iter().find(|(n, _)| n == edit.name) {
                Some(_) if edit.is_noop() => {}
                Some((_, part)) => {
                    let patched = patch_sheet(&self.text(part)?, edit, &mut styles)?;
                    dropped_formula |= patched.dropped_formula;
                    replaced.insert(part.clone(), patched.xml.into_bytes());
                }
                None => {
                    let rebuild = SheetEdit {
                        name: edit.name,
                        cells: edit.cells.clone(),
                        rebuild: true,
                        freeze_panes: edit.freeze_panes,
                    };
                    let patched = patch_sheet(EMPTY_WORKSHEET, &rebuild, &mut styles)?;
                    let rel_id = (rels.len() + 1..)
                        .map(|n| format!("rId{n}"))
                        .find(|id| !rel_ids.contains(id))
                        .unwrap_or_default();
                    rel_ids.insert(rel_id.clone());
                    let part = self.free_sheet_part(&added);
                    added_parts.push((part.clone(), patched.xml.into_bytes()));
                    added.push(NewSheet {
                        name: edit.name.to_string(),
                        part,
                        rel_id,
                        sheet_id: self.max_sheet_id + 1 + added.len() as u32,
                        before: edits[index + 1..]
                            .iter()
                            .find(|e| self.has_sheet(e.name))
                            .map(|e| e.name.to_string()),
                    });
                }
            }
        }

        let content_types = "[Content_Types].xml";
        let rels_part = self.workbook_rels_part();
        let mut content_xml = self.text(content_types)?;
        let mut rels_xml = self.text(&rels_part)?;

        if !added.is_empty() {
            // Old sheet position -> new position, for sheet-indexed attributes.
            let positions: Vec<usize> = self
                .sheets
                .iter()
                .map(|(name, _)| edits.iter().position(|e| e.name == name).unwrap_or(0))
                .collect();
            let workbook_xml = patch_workbook(&self.text(&self.workbook_part)?, &added, &positions, &self.rel_id_attr)?;
            replaced.insert(self.workbook_part.clone(), workbook_xml.into_bytes());

            let base = parent_dir(&self.workbook_part);
            let rel_elements = added.iter().map(|s| {
                let target = relative_to(base, &s.part);
                element(
                    "Relationship",
                    &[("Id", s.rel_id.as_str()), ("Type", WORKSHEET_REL), ("Target", target.as_str())],
                )
            });
            rels_xml = append_children(&rels_xml, b"Relationships", rel_elements.collect())?;
            let overrides = added.iter().map(|s| {
                let part_name = format!("/{}", s.part);
                element(
                    "Override",
                    &[("PartName", part_name.as_str()), ("ContentType", WORKSHEET_CONTENT_TYPE)],
                )
            });
            content_xml = append_children(&content_xml, b"Types", overrides.collect())?;
        }

        // A calculation chain naming a formula cell that is now a value makes
        // Excel repair the file; it rebuilds the chain when it is missing.
        let mut removed: HashSet<String> = HashSet::new();
        if dropped_formula {
            for rel in rels.iter().filter(|r| r.kind.ends_with("/calcChain")) {
                removed.insert(rel.target.clone());
                rels_xml = remove_children(&rels_xml, b"Relationship", b"Id", &rel.id)?;
                content_xml = remove_children(&content_xml, b"Override", b"PartName", &format!("/{}", rel.target))?;
            }
        }

        replaced.insert(content_types.to_string(), content_xml.into_bytes());
        replaced.insert(rels_part, rels_xml.into_bytes());
        if let Some(part) = styles_part {
            if let Some(xml) = styles.render(&self.text(&part)?)? {
                replaced.insert(part, xml.into_bytes());
            }
        }

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        // Fixed timestamps keep repeated saves byte-identical.
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        for (name, data) in &self.parts {
            if removed.contains(name) {
                continue;
            }
            if name.ends_with('/') {
                zip.add_directory(name.as_str(), options)?;
                continue;
            }
            zip.start_file(name.as_str(), options)?;
            zip.write_all(replaced.get(name).unwrap_or(data))?;
        }
        for (name, data) in &added_parts {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }
        Ok(zip.finish()?.into_inner())
    }
}

fn is(e: &BytesStart<'_>, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

fn is_end(e: &BytesEnd<'_>, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Copy of `e` with `key` set to `value`, or removed when `value` is `None`.
fn with_attr(e: &BytesStart<'_>, key: &str, value: Option<&str>) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for a in e.attributes().flatten() {
        if a.key.as_ref() != key.as_bytes() {
            out.push_attribute(a);
        }
    }
    if let Some(value) = value {
        out.push_attribute((key, value));
    }
    out
}

fn element(name: &'static str, attrs: &[(&str, &str)]) -> BytesStart<'static> {
    let mut e = BytesStart::new(name);
    for &pair in attrs {
        e.push_attribute(pair);
    }
    e
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| PosmapError::Other(format!("xlsx xml: {e}")))
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn rels_part(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolve a relationship target against the directory of its source part.
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

fn relative_to(base_dir: &str, part: &str) -> String {
    match part.strip_prefix(base_dir).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !base_dir.is_empty() => rest.to_string(),
        _ => format!("/{part}"),
    }
}

fn relationships(xml: &str, base_dir: &str) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if is(&e, b"Relationship") => {
                let external = attr(&e, b"TargetMode").is_some_and(|m| m == "External");
                let (Some(id), Some(kind), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Type"), attr(&e, b"Target"))
                else {
                    continue;
                };
                let target = if external { target } else { resolve_target(base_dir, &target) };
                out.push(Relationship { id, kind, target });
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Insert `children` just before the closing tag of `parent`.
fn append_children(xml: &str, parent: &[u8], children: Vec<BytesStart<'static>>) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            Event::End(ref e) if is_end(e, parent) => {
                for child in &children {
                    writer.write_event(Event::Empty(child.borrow()))?;
                }
                writer.write_event(event.borrow())?;
            }
            _ => writer.write_event(event.borrow())?,
        }
    }
    into_string(writer.into_inner())
}

/// Drop every `tag` element whose `key` attribute equals `value`.
fn remove_children(xml: &str, tag: &[u8], key: &[u8], value: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut ignored = false;
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            Event::Empty(ref e) if is(e, tag) && attr(e, key).as_deref() == Some(value) => {}
            Event::Start(ref e) if is(e, tag) && attr(e, key).as_deref() == Some(value) => {
                skip_element(&mut reader, &mut ignored)?;
            }
            _ => writer.write_event(event.borrow())?,
        }
    }
    into_string(writer.into_inner())
}

/// Consume everything up to the end of the element whose start tag was just
/// read, noting whether it held a formula.
fn skip_element(reader: &mut Reader<&[u8]>, saw_formula: &mut bool) -> Result<()> {
    let mut depth = 1usize;
    while depth > 0 {
        match reader.read_event()? {
            Event::Start(e) => {
                *saw_formula |= is(&e, b"f");
                depth += 1;
            }
            Event::Empty(e) => *saw_formula |= is(&e, b"f"),
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(PosmapError::Other("truncated xlsx xml".to_string())),
            _ => {}
        }
    }
    Ok(())
}

/// Sheet list with new sheets spliced in, and sheet-index attributes moved
/// to follow their sheets.
fn patch_workbook(xml: &str, added: &[NewSheet], positions: &[usize], rel_id_attr: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut in_sheets = false;

    let write_sheet = |writer: &mut Writer<Vec<u8>>, sheet: &NewSheet| -> Result<()> {
        let sheet_id = sheet.sheet_id.to_string();
        let e = element(
            "sheet",
            &[
                ("name", sheet.name.as_str()),
                ("sheetId", sheet_id.as_str()),
                (rel_id_attr, sheet.rel_id.as_str()),
            ],
        );
        writer.write_event(Event::Empty(e))?;
        Ok(())
    };
    let remap = |e: &BytesStart<'_>, keys: &[&str]| -> BytesStart<'static> {
        let mut out = with_attr(e, "", None);
        for key in keys {
            let moved = attr(e, key.as_bytes())
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|old| positions.get(old))
                .map(|new| new.to_string());
            if let Some(new) = moved {
                out = with_attr(&out, key, Some(&new));
            }
        }
        out
    };

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if is(e, b"sheets") => {
                in_sheets = true;
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) | Event::Empty(ref e) if in_sheets && is(e, b"sheet") => {
                let name = attr(e, b"name");
                for sheet in added.iter().filter(|s| s.before.is_some() && s.before == name) {
                    write_sheet(&mut writer, sheet)?;
                }
                writer.write_event(event.borrow())?;
            }
            Event::End(ref e) if in_sheets && is_end(e, b"sheets") => {
                for sheet in added.iter().filter(|s| s.before.is_none()) {
                    write_sheet(&mut writer, sheet)?;
                }
                in_sheets = false;
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) if is(e, b"definedName") => {
                writer.write_event(Event::Start(remap(e, &["localSheetId"])))?;
            }
            Event::Empty(ref e) if is(e, b"workbookView") => {
                writer.write_event(Event::Empty(remap(e, &["activeTab", "firstSheet"])))?;
            }
            Event::Start(ref e) if is(e, b"workbookView") => {
                writer.write_event(Event::Start(remap(e, &["activeTab", "firstSheet"])))?;
            }
            _ => writer.write_event(event.borrow())?,
        }
    }
    into_string(writer.into_inner())
}

type PendingCells<'e, 'c> = Peekable<slice::Iter<'e, ((u32, u16), Option<&'c Cell>)>>;

struct PatchedSheet {
    xml: String,
    /// A formula cell was overwritten or removed.
    dropped_formula: bool,
}

/// Rewrite the touched cells of one worksheet and leave everything else as
/// it was.
fn patch_sheet(xml: &str, edit: &SheetEdit<'_>, styles: &mut StyleBook) -> Result<PatchedSheet> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut pending: PendingCells<'_, '_> = edit.cells.iter().peekable();
    let mut dropped_formula = false;
    let mut in_data = false;
    let mut in_view = false;
    let mut row: Option<u32> = None;
    let mut last_row = 0u32;
    let mut last_col = 0u16;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if is(e, b"sheetData") => {
                in_data = true;
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if is(e, b"sheetData") => {
                writer.write_event(Event::Start(e.borrow()))?;
                write_new_rows(&mut writer, &mut pending, None, styles)?;
                writer.write_event(Event::End(e.to_end()))?;
            }
            Event::End(ref e) if in_data && is_end(e, b"sheetData") => {
                write_new_rows(&mut writer, &mut pending, None, styles)?;
                in_data = false;
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) | Event::Empty(ref e) if in_data && row.is_none() && is(e, b"row") => {
                let empty = matches!(event, Event::Empty(_));
                let r = attr(e, b"r").and_then(|v| v.parse().ok()).unwrap_or(last_row + 1);
                last_row = r;
                last_col = 0;
                if edit.rebuild {
                    if !empty {
                        skip_element(&mut reader, &mut dropped_formula)?;
                    }
                    continue;
                }
                write_new_rows(&mut writer, &mut pending, Some(r), styles)?;
                let touched = pending.peek().is_some_and(|((pr, _), _)| *pr == r);
                if !touched {
                    writer.write_event(event.borrow())?;
                    if !empty {
                        row = Some(r);
                    }
                    continue;
                }
                // Spans are a load hint and go stale once cells are added.
                writer.write_event(Event::Start(with_attr(e, "spans", None)))?;
                if empty {
                    write_cells_before(&mut writer, &mut pending, r, u16::MAX, styles)?;
                    writer.write_event(Event::End(e.to_end()))?;
                } else {
                    row = Some(r);
                }
            }
            Event::End(ref e) if row.is_some() && is_end(e, b"row") => {
                if let Some(r) = row.take() {
                    write_cells_before(&mut writer, &mut pending, r, u16::MAX, styles)?;
                }
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) | Event::Empty(ref e) if row.is_some() && is(e, b"c") => {
                let r = row.unwrap_or(last_row);
                let col = attr(e, b"r")
                    .and_then(|v| parse_ref(&v))
                    .map(|(_, c)| c)
                    .unwrap_or(last_col + 1);
                last_col = col;
                write_cells_before(&mut writer, &mut pending, r, col, styles)?;
                match pending.next_if(|((pr, pc), _)| *pr == r && *pc == col) {
                    Some(&(_, cell)) => {
                        if matches!(event, Event::Start(_)) {
                            skip_element(&mut reader, &mut dropped_formula)?;
                        }
                        let base = attr(e, b"s").and_then(|v| v.parse().ok());
                        write_cell(&mut writer, r, col, cell, base, styles)?;
                    }
                    None => writer.write_event(event.borrow())?,
                }
            }
            Event::Start(ref e) | Event::Empty(ref e) if is(e, b"dimension") => {
                let original = attr(e, b"ref");
                match dimension(original.as_deref(), edit) {
                    Some(range) => {
                        let updated = with_attr(e, "ref", Some(&range));
                        if matches!(event, Event::Empty(_)) {
                            writer.write_event(Event::Empty(updated))?;
                        } else {
                            writer.write_event(Event::Start(updated))?;
                        }
                    }
                    None => writer.write_event(event.borrow())?,
                }
            }
            Event::Start(ref e) | Event::Empty(ref e) if !in_view && is(e, b"sheetView") => match edit.freeze_panes {
                Some(panes) => {
                    writer.write_event(Event::Start(e.borrow()))?;
                    write_pane(&mut writer, panes)?;
                    if matches!(event, Event::Empty(_)) {
                        writer.write_event(Event::End(e.to_end()))?;
                    } else {
                        in_view = true;
                    }
                }
                None => writer.write_event(event.borrow())?,
            },
            Event::Start(ref e) | Event::Empty(ref e) if in_view && (is(e, b"pane") || is(e, b"selection")) => {
                if matches!(event, Event::Start(_)) {
                    skip_element(&mut reader, &mut dropped_formula)?;
                }
            }
            Event::End(ref e) if in_view && is_end(e, b"sheetView") => {
                in_view = false;
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) | Event::Empty(ref e) if edit.rebuild && is(e, b"mergeCells") => {
                if matches!(event, Event::Start(_)) {
                    skip_element(&mut reader, &mut dropped_formula)?;
                }
            }
            _ => writer.write_event(event.borrow())?,
        }
    }

    Ok(PatchedSheet {
        xml: into_string(writer.into_inner())?,
        dropped_formula,
    })
}

/// Emit pending rows numbered below `before` (all of them for `None`) as new
/// `<row>` elements. Rows holding only clears produce nothing.
fn write_new_rows(
    writer: &mut Writer<Vec<u8>>,
    pending: &mut PendingCells<'_, '_>,
    before: Option<u32>,
    styles: &mut StyleBook,
) -> Result<()> {
    while let Some(&&((r, _), _)) = pending.peek() {
        if before.is_some_and(|b| r >= b) {
            break;
        }
        let mut cells = Vec::new();
        while let Some(&((_, col), cell)) = pending.next_if(|((pr, _), _)| *pr == r) {
            cells.push((col, cell));
        }
        if cells.iter().all(|(_, cell)| cell.is_none()) {
            continue;
        }
        let r_text = r.to_string();
        writer.write_event(Event::Start(element("row", &[("r", r_text.as_str())])))?;
        for (col, cell) in cells {
            write_cell(writer, r, col, cell, None, styles)?;
        }
        writer.write_event(Event::End(BytesEnd::new("row")))?;
    }
    Ok(())
}

/// Emit pending cells of row `r` left of column `col`.
fn write_cells_before(
    writer: &mut Writer<Vec<u8>>,
    pending: &mut PendingCells<'_, '_>,
    r: u32,
    col: u16,
    styles: &mut StyleBook,
) -> Result<()> {
    while let Some(&((_, c), cell)) = pending.next_if(|((pr, pc), _)| *pr == r && *pc < col) {
        write_cell(writer, r, c, cell, None, styles)?;
    }
    Ok(())
}

fn write_text(writer: &mut Writer<Vec<u8>>, name: &'static str, text: &str) -> Result<()> {
    let mut start = BytesStart::new(name);
    if text.trim() != text {
        start.push_attribute(("xml:space", "preserve"));
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// One `<c>` element. `base` is the style of the cell being replaced; a
/// number format is layered over it, and a cleared cell keeps it.
fn write_cell(
    writer: &mut Writer<Vec<u8>>,
    row: u32,
    col: u16,
    cell: Option<&Cell>,
    base: Option<u32>,
    styles: &mut StyleBook,
) -> Result<()> {
    let reference = cell_ref(row, col);
    let mut start = element("c", &[("r", reference.as_str())]);
    let Some(cell) = cell else {
        if let Some(s) = base {
            start.push_attribute(("s", s.to_string().as_str()));
            writer.write_event(Event::Empty(start))?;
        }
        return Ok(());
    };

    let style = match cell.num_format.as_deref() {
        Some(code) => styles.style_for(base, code),
        None => base,
    };
    if let Some(s) = style {
        start.push_attribute(("s", s.to_string().as_str()));
    }
    match &cell.value {
        CellValue::Text(text) => {
            start.push_attribute(("t", "inlineStr"));
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Start(BytesStart::new("is")))?;
            write_text(writer, "t", text)?;
            writer.write_event(Event::End(BytesEnd::new("is")))?;
        }
        CellValue::Number(n) if n.is_finite() => {
            writer.write_event(Event::Start(start))?;
            write_text(writer, "v", &n.to_string())?;
        }
        CellValue::Number(_) => {
            start.push_attribute(("t", "e"));
            writer.write_event(Event::Start(start))?;
            write_text(writer, "v", "#NUM!")?;
        }
        CellValue::Bool(b) => {
            start.push_attribute(("t", "b"));
            writer.write_event(Event::Start(start))?;
            write_text(writer, "v", if *b { "1" } else { "0" })?;
        }
        CellValue::Formula(formula) => {
            writer.write_event(Event::Start(start))?;
            write_text(writer, "f", formula)?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("c")))?;
    Ok(())
}

fn write_pane(writer: &mut Writer<Vec<u8>>, (row, col): (u32, u16)) -> Result<()> {
    let (rows, cols) = (row.saturating_sub(1), col.saturating_sub(1));
    let active = match (cols > 0, rows > 0) {
        (true, true) => "bottomRight",
        (false, true) => "bottomLeft",
        (true, false) => "topRight",
        (false, false) => return Ok(()),
    };
    let top_left = cell_ref(row.max(1), col.max(1));
    let mut pane = BytesStart::new("pane");
    if cols > 0 {
        pane.push_attribute(("xSplit", cols.to_string().as_str()));
    }
    if rows > 0 {
        pane.push_attribute(("ySplit", rows.to_string().as_str()));
    }
    pane.push_attribute(("topLeftCell", top_left.as_str()));
    pane.push_attribute(("activePane", active));
    pane.push_attribute(("state", "frozen"));
    writer.write_event(Event::Empty(pane))?;
    let selection = element(
        "selection",
        &[("pane", active), ("activeCell", top_left.as_str()), ("sqref", top_left.as_str())],
    );
    writer.write_event(Event::Empty(selection))?;
    Ok(())
}

/// Used range after the edit, or `None` to keep the original.
fn dimension(original: Option<&str>, edit: &SheetEdit<'_>) -> Option<String> {
    let mut bounds = if edit.rebuild { None } else { original.and_then(parse_range) };
    for &((r, c), cell) in &edit.cells {
        if cell.is_none() {
            continue;
        }
        bounds = Some(match bounds {
            None => (r, c, r, c),
            Some((r0, c0, r1, c1)) => (r0.min(r), c0.min(c), r1.max(r), c1.max(c)),
        });
    }
    if edit.cells.iter().all(|(_, cell)| cell.is_none()) && !edit.rebuild {
        return None;
    }
    Some(match bounds {
        None => "A1".to_string(),
        Some((r0, c0, r1, c1)) if (r0, c0) == (r1, c1) => cell_ref(r0, c0),
        Some((r0, c0, r1, c1)) => format!("{}:{}", cell_ref(r0, c0), cell_ref(r1, c1)),
    })
}

fn parse_range(range: &str) -> Option<(u32, u16, u32, u16)> {
    let (start, end) = range.split_once(':').unwrap_or((range, range));
    let (r0, c0) = parse_ref(start)?;
    let (r1, c1) = parse_ref(end)?;
    Some((r0, c0, r1, c1))
}

/// `"B24"` -> `(24, 2)`. Absolute markers are ignored.
pub fn parse_ref(reference: &str) -> Option<(u32, u16)> {
    let reference = reference.replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let col = letters.chars().try_fold(0u32, |acc, c| {
        acc.checked_mul(26)?
            .checked_add(c.to_ascii_uppercase() as u32 - 'A' as u32 + 1)
    })?;
    let row: u32 = digits.parse().ok()?;
    (row > 0 && col <= u16::MAX as u32).then_some((row, col as u16))
}

/// `(24, 2)` -> `"B24"`.
pub fn cell_ref(row: u32, col: u16) -> String {
    let mut letters = Vec::new();
    let mut n = col as u32;
    while n > 0 {
        letters.push(char::from(b'A' + ((n - 1) % 26) as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect::<String>() + &row.to_string()
}

fn builtin_num_fmt(code: &str) -> Option<u32> {
    match code {
        "General" => Some(0),
        "0" => Some(1),
        "0.00" => Some(2),
        "#,##0" => Some(3),
        "#,##0.00" => Some(4),
        "0%" => Some(9),
        "0.00%" => Some(10),
        "@" => Some(49),
        _ => None,
    }
}

/// Cell formats of the styles part, plus the ones a save adds.
#[derive(Debug, Default)]
struct StyleBook {
    /// The part has a `cellXfs` table to extend.
    present: bool,
    has_num_fmts: bool,
    num_fmts: Vec<(u32, String)>,
    xfs: Vec<Vec<Event<'static>>>,
    added_num_fmts: Vec<(u32, String)>,
    added_xfs: Vec<Vec<Event<'static>>>,
    /// (base style, number format id) -> style index.
    cache: HashMap<(u32, u32), u32>,
}

impl StyleBook {
    fn parse(xml: &str) -> Result<Self> {
        let mut book = StyleBook::default();
        let mut reader = Reader::from_str(xml);
        let mut in_xfs = false;
        loop {
            match reader.read_event()? {
                Event::Eof => break,
                Event::Start(e) | Event::Empty(e) if is(&e, b"numFmts") => book.has_num_fmts = true,
                Event::Start(e) | Event::Empty(e) if is(&e, b"numFmt") => {
                    let id = attr(&e, b"numFmtId").and_then(|v| v.parse().ok());
                    if let (Some(id), Some(code)) = (id, attr(&e, b"formatCode")) {
                        book.num_fmts.push((id, code));
                    }
                }
                Event::Start(e) if is(&e, b"cellXfs") => {
                    book.present = true;
                    in_xfs = true;
                }
                Event::End(e) if is_end(&e, b"cellXfs") => in_xfs = false,
                Event::Empty(e) if in_xfs && is(&e, b"xf") => {
                    book.xfs.push(vec![Event::Empty(e.into_owned())]);
                }
                Event::Start(e) if in_xfs && is(&e, b"xf") => {
                    let mut xf = vec![Event::Start(e.into_owned())];
                    let mut depth = 1usize;
                    while depth > 0 {
                        let inner = reader.read_event()?;
                        match inner {
                            Event::Start(_) => depth += 1,
                            Event::End(_) => depth -= 1,
                            Event::Eof => return Err(PosmapError::Other("truncated styles xml".to_string())),
                            _ => {}
                        }
                        xf.push(inner.into_owned());
                    }
                    book.xfs.push(xf);
                }
                _ => {}
            }
        }
        Ok(book)
    }

    fn num_fmt_id(&mut self, code: &str) -> u32 {
        if let Some(id) = builtin_num_fmt(code) {
            return id;
        }
        let known = self.num_fmts.iter().chain(&self.added_num_fmts);
        if let Some((id, _)) = known.clone().find(|(_, c)| c == code) {
            return *id;
        }
        let id = known
            .map(|(id, _)| id + 1)
            .max()
            .unwrap_or(FIRST_CUSTOM_NUM_FMT)
            .max(FIRST_CUSTOM_NUM_FMT);
        self.added_num_fmts.push((id, code.to_string()));
        id
    }

    /// Style index showing `code` with everything else taken from `base`.
    fn style_for(&mut self, base: Option<u32>, code: &str) -> Option<u32> {
        if !self.present {
            return base;
        }
        let base = base.unwrap_or(0);
        let fmt = self.num_fmt_id(code);
        if let Some(&style) = self.cache.get(&(base, fmt)) {
            return Some(style);
        }

        let template = self.xfs.get(base as usize).cloned();
        let current = template
            .as_ref()
            .and_then(|xf| match xf.first() {
                Some(Event::Start(e)) | Some(Event::Empty(e)) => attr(e, b"numFmtId"),
                _ => None,
            })
            .and_then(|v| v.parse::<u32>().ok());
        let style = match template {
            Some(_) if current == Some(fmt) => base,
            template => {
                let mut xf = template.unwrap_or_else(|| {
                    vec![Event::Empty(element(
                        "xf",
                        &[("numFmtId", "0"), ("fontId", "0"), ("fillId", "0"), ("borderId", "0"), ("xfId", "0")],
                    ))]
                });
                let fmt_text = fmt.to_string();
                let head = match xf.first() {
                    Some(Event::Start(e)) => Some(Event::Start(number_format_xf(e, &fmt_text))),
                    Some(Event::Empty(e)) => Some(Event::Empty(number_format_xf(e, &fmt_text))),
                    _ => None,
                };
                if let Some(head) = head {
                    xf[0] = head;
                }
                self.added_xfs.push(xf);
                (self.xfs.len() + self.added_xfs.len() - 1) as u32
            }
        };
        self.cache.insert((base, fmt), style);
        Some(style)
    }

    fn write_num_fmts(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        for (id, code) in &self.added_num_fmts {
            let id = id.to_string();
            let e = element("numFmt", &[("numFmtId", id.as_str()), ("formatCode", code.as_str())]);
            writer.write_event(Event::Empty(e))?;
        }
        Ok(())
    }

    /// The styles part with added formats appended, or `None` when nothing
    /// was added.
    fn render(&self, xml: &str) -> Result<Option<String>> {
        if self.added_num_fmts.is_empty() && self.added_xfs.is_empty() {
            return Ok(None);
        }
        let fmt_count = (self.num_fmts.len() + self.added_num_fmts.len()).to_string();
        let xf_count = (self.xfs.len() + self.added_xfs.len()).to_string();
        let mut reader = Reader::from_str(xml);
        let mut writer = Writer::new(Vec::new());
        loop {
            let event = reader.read_event()?;
            match event {
                Event::Eof => break,
                Event::Start(ref e) if is(e, b"styleSheet") => {
                    writer.write_event(event.borrow())?;
                    // numFmts must be the first child.
                    if !self.has_num_fmts && !self.added_num_fmts.is_empty() {
                        writer.write_event(Event::Start(element("numFmts", &[("count", fmt_count.as_str())])))?;
                        self.write_num_fmts(&mut writer)?;
                        writer.write_event(Event::End(BytesEnd::new("numFmts")))?;
                    }
                }
                Event::Start(ref e) if is(e, b"numFmts") => {
                    writer.write_event(Event::Start(with_attr(e, "count", Some(&fmt_count))))?;
                }
                Event::Empty(ref e) if is(e, b"numFmts") => {
                    writer.write_event(Event::Start(with_attr(e, "count", Some(&fmt_count))))?;
                    self.write_num_fmts(&mut writer)?;
                    writer.write_event(Event::End(e.to_end()))?;
                }
                Event::End(ref e) if is_end(e, b"numFmts") => {
                    self.write_num_fmts(&mut writer)?;
                    writer.write_event(event.borrow())?;
                }
                Event::Start(ref e) if is(e, b"cellXfs") => {
                    writer.write_event(Event::Start(with_attr(e, "count", Some(&xf_count))))?;
                }
                Event::End(ref e) if is_end(e, b"cellXfs") => {
                    for xf in &self.added_xfs {
                        for part in xf {
                            writer.write_event(part.borrow())?;
                        }
                    }
                    writer.write_event(event.borrow())?;
                }
                _ => writer.write_event(event.borrow())?,
            }
        }
        Ok(Some(into_string(writer.into_inner())?))
    }
}

fn number_format_xf(e: &BytesStart<'_>, fmt: &str) -> BytesStart<'static> {
    let without = with_attr(e, "applyNumberFormat", None);
    let mut xf = with_attr(&without, "numFmtId", Some(fmt));
    xf.push_attribute(("applyNumberFormat", "1"));
    xf
}
