//! 将 GEODATA 对象写回 DXF 文本。
//!
//! 只改写与地理配准相关的记录：删除旧的 GEODATA，在模型空间块记录的扩展字典中登记
//! `ACAD_GEOGRAPHICDATA`，并推进 `$HANDSEED`。其余组码原样输出。

use std::fmt::Write;

use geocad_core::document::GeoData;
use tracing::debug;

use crate::{DxfError, DxfReader, IoError, encode_caret};

type Pair = (i32, String);

/// DXF 字符串组码的最大长度。
const MAX_CHUNK_LEN: usize = 255;

#[derive(Debug, Default, Clone, Copy)]
pub struct GeodataInjector;

/// 第一遍扫描收集的句柄信息。
#[derive(Debug, Default)]
struct HandleScan {
    handle_seed: Option<u64>,
    max_handle: u64,
    modelspace_record: Option<String>,
    modelspace_xdict: Option<String>,
    existing_geodata: Option<String>,
}

impl GeodataInjector {
    pub fn new() -> Self {
        Self
    }

    /// 返回嵌入 `geodata` 后的完整 DXF 文本。已有 GEODATA 的句柄会被复用。
    pub fn inject(&self, source: &str, geodata: &GeoData) -> Result<String, IoError> {
        let pairs = read_pairs(source)?;
        let (mut records, sections) = split_records(pairs);
        let scan = scan_handles(&records, &sections);

        let mut next_handle = scan
            .handle_seed
            .unwrap_or(0)
            .max(scan.max_handle + 1)
            .max(1);
        let mut allocate = || {
            let handle = format!("{next_handle:X}");
            next_handle += 1;
            handle
        };

        let geodata_handle = scan.existing_geodata.clone().unwrap_or_else(&mut allocate);
        let mut new_objects: Vec<Vec<Pair>> = Vec::new();

        let xdict = match (&scan.modelspace_record, &scan.modelspace_xdict) {
            (Some(_), Some(xdict)) => {
                let patched = register_in_dictionary(&mut records, xdict, &geodata_handle);
                if !patched {
                    return Err(DxfError::invalid(format!(
                        "模型空间扩展字典 {xdict} 不存在"
                    ))
                    .into());
                }
                Some(xdict.clone())
            }
            (Some(record), None) => {
                let xdict = allocate();
                attach_xdict(&mut records, record, &xdict);
                new_objects.push(dictionary_record(&xdict, record, &geodata_handle));
                Some(xdict)
            }
            (None, _) => None,
        };

        new_objects.push(geodata_record(
            geodata,
            &geodata_handle,
            xdict.as_deref(),
            scan.modelspace_record.as_deref(),
        ));

        let mut output: Vec<Vec<Pair>> = Vec::with_capacity(records.len() + new_objects.len() + 2);
        let mut inserted = false;
        for (record, section) in records.into_iter().zip(sections) {
            if section.as_deref() == Some("OBJECTS") && record_kind(&record) == "GEODATA" {
                continue;
            }
            let is_objects_end =
                section.as_deref() == Some("OBJECTS") && record_kind(&record) == "ENDSEC";
            let is_eof = record_kind(&record) == "EOF";
            if !inserted && is_objects_end {
                output.append(&mut new_objects);
                inserted = true;
            }
            if !inserted && is_eof {
                output.push(vec![(0, "SECTION".to_string()), (2, "OBJECTS".to_string())]);
                output.append(&mut new_objects);
                output.push(vec![(0, "ENDSEC".to_string())]);
                inserted = true;
            }
            output.push(record);
        }
        if !inserted {
            return Err(DxfError::invalid("DXF 缺少 EOF 标记，无法写入 GEODATA").into());
        }

        let seed = format!("{next_handle:X}");
        update_handle_seed(&mut output, &seed);
        debug!(handle = %geodata_handle, seed = %seed, "写入 GEODATA 对象");

        let mut text = String::new();
        for (code, value) in output.iter().flatten() {
            // 写入 String 不会失败
            let _ = writeln!(text, "{code:>3}\n{value}");
        }
        Ok(text)
    }
}

fn read_pairs(source: &str) -> Result<Vec<Pair>, DxfError> {
    let mut reader = DxfReader::new(source);
    let mut pairs = Vec::new();
    while let Some(pair) = reader.next_pair()? {
        pairs.push(pair);
    }
    Ok(pairs)
}

/// 以组码 0 为界拆分记录，并标注每条记录所在的段。
fn split_records(pairs: Vec<Pair>) -> (Vec<Vec<Pair>>, Vec<Option<String>>) {
    let mut records: Vec<Vec<Pair>> = Vec::new();
    for pair in pairs {
        match records.last_mut() {
            Some(current) if pair.0 != 0 => current.push(pair),
            _ => records.push(vec![pair]),
        }
    }

    let mut sections = Vec::with_capacity(records.len());
    let mut current: Option<String> = None;
    for record in &records {
        match record_kind(record) {
            "SECTION" => {
                current = value_of(record, 2).map(str::to_string);
                sections.push(current.clone());
            }
            "ENDSEC" => sections.push(current.take()),
            _ => sections.push(current.clone()),
        }
    }
    (records, sections)
}

fn scan_handles(records: &[Vec<Pair>], sections: &[Option<String>]) -> HandleScan {
    let mut scan = HandleScan::default();
    let mut geodata: Vec<(String, Option<String>)> = Vec::new();

    for (record, section) in records.iter().zip(sections) {
        if section.as_deref() == Some("HEADER") {
            let mut iter = record.iter();
            while let Some((code, value)) = iter.next() {
                if *code == 9 && value.trim() == "$HANDSEED" {
                    scan.handle_seed = iter.next().and_then(|(_, seed)| parse_handle(seed));
                }
            }
            continue;
        }

        for (code, value) in record {
            if matches!(code, 5 | 105) {
                if let Some(handle) = parse_handle(value) {
                    scan.max_handle = scan.max_handle.max(handle);
                }
            }
        }

        match record_kind(record) {
            "BLOCK_RECORD" => {
                let is_modelspace = value_of(record, 2)
                    .is_some_and(|name| name.eq_ignore_ascii_case("*Model_Space"));
                if is_modelspace {
                    scan.modelspace_record = value_of(record, 5).map(str::to_string);
                    scan.modelspace_xdict = xdict_of(record);
                }
            }
            "GEODATA" if section.as_deref() == Some("OBJECTS") => {
                if let Some(handle) = value_of(record, 5) {
                    geodata.push((handle.to_string(), host_of(record)));
                }
            }
            _ => {}
        }
    }

    let preferred = geodata
        .iter()
        .position(|(_, host)| host.is_some() && *host == scan.modelspace_record)
        .unwrap_or(0);
    scan.existing_geodata = geodata.into_iter().nth(preferred).map(|(handle, _)| handle);
    scan
}

/// 在扩展字典中登记或更新 `ACAD_GEOGRAPHICDATA` 条目。字典不存在时返回 false。
fn register_in_dictionary(records: &mut [Vec<Pair>], xdict: &str, geodata_handle: &str) -> bool {
    let Some(dictionary) = records
        .iter_mut()
        .find(|record| record_kind(record) == "DICTIONARY" && value_of(record, 5) == Some(xdict))
    else {
        return false;
    };

    let entry = dictionary
        .iter()
        .position(|(code, value)| *code == 3 && value.trim() == "ACAD_GEOGRAPHICDATA");
    match entry {
        Some(index) => match dictionary.get_mut(index + 1) {
            Some((code, value)) if matches!(*code, 350 | 360) => {
                *value = geodata_handle.to_string();
            }
            _ => dictionary.insert(index + 1, (360, geodata_handle.to_string())),
        },
        None => {
            dictionary.push((3, "ACAD_GEOGRAPHICDATA".to_string()));
            dictionary.push((360, geodata_handle.to_string()));
        }
    }
    true
}

/// 为没有扩展字典的模型空间块记录挂接新字典。
fn attach_xdict(records: &mut [Vec<Pair>], modelspace_record: &str, xdict: &str) {
    let Some(record) = records.iter_mut().find(|record| {
        record_kind(record) == "BLOCK_RECORD" && value_of(record, 5) == Some(modelspace_record)
    }) else {
        return;
    };
    let at = record
        .iter()
        .position(|(code, _)| *code == 5)
        .map_or(record.len(), |index| index + 1);
    record.splice(
        at..at,
        [
            (102, "{ACAD_XDICTIONARY".to_string()),
            (360, xdict.to_string()),
            (102, "}".to_string()),
        ],
    );
}

fn dictionary_record(handle: &str, owner: &str, geodata_handle: &str) -> Vec<Pair> {
    vec![
        (0, "DICTIONARY".to_string()),
        (5, handle.to_string()),
        (330, owner.to_string()),
        (100, "AcDbDictionary".to_string()),
        (280, "1".to_string()),
        (281, "1".to_string()),
        (3, "ACAD_GEOGRAPHICDATA".to_string()),
        (360, geodata_handle.to_string()),
    ]
}

fn geodata_record(
    geodata: &GeoData,
    handle: &str,
    xdict: Option<&str>,
    host: Option<&str>,
) -> Vec<Pair> {
    let mut pairs: Vec<Pair> = vec![(0, "GEODATA".to_string()), (5, handle.to_string())];
    if let Some(xdict) = xdict {
        pairs.push((102, "{ACAD_REACTORS".to_string()));
        pairs.push((330, xdict.to_string()));
        pairs.push((102, "}".to_string()));
    }
    pairs.push((330, xdict.unwrap_or("0").to_string()));
    pairs.push((100, "AcDbGeoData".to_string()));
    pairs.push((90, geodata.version.to_string()));
    pairs.push((330, host.unwrap_or("0").to_string()));
    pairs.push((70, geodata.coordinate_type.code().to_string()));

    let design = geodata.design_point;
    let reference = geodata.reference_point;
    pairs.extend([
        (10, design.x().to_string()),
        (20, design.y().to_string()),
        (30, design.z().to_string()),
        (11, reference.x().to_string()),
        (21, reference.y().to_string()),
        (31, reference.z().to_string()),
        (40, geodata.horizontal_unit_scale.to_string()),
        (91, geodata.horizontal_units.to_string()),
        (41, "1".to_string()),
        (92, geodata.horizontal_units.to_string()),
        (210, "0".to_string()),
        (220, "0".to_string()),
        (230, "1".to_string()),
        (12, geodata.north_direction.x().to_string()),
        (22, geodata.north_direction.y().to_string()),
        (95, "1".to_string()),
        (141, "1".to_string()),
        (294, "0".to_string()),
        (142, "0".to_string()),
        (143, "0".to_string()),
    ]);

    let chunks = chunk_definition(&encode_caret(&geodata.coordinate_system_definition));
    let last = chunks.len().saturating_sub(1);
    for (index, chunk) in chunks.into_iter().enumerate() {
        let code = if index == last { 301 } else { 303 };
        pairs.push((code, chunk));
    }

    pairs.extend([
        (302, String::new()),
        (305, String::new()),
        (306, String::new()),
        (307, String::new()),
        (93, "0".to_string()),
        (96, "0".to_string()),
    ]);
    pairs
}

/// 按最大长度切分已转义的坐标系定义，不在 `^` 转义序列中间断开。
fn chunk_definition(encoded: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars().peekable();
    while let Some(ch) = chars.next() {
        let needed = if ch == '^' { 2 } else { 1 };
        if current.len() + needed > MAX_CHUNK_LEN {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
        if ch == '^' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
        }
    }
    chunks.push(current);
    chunks
}

fn update_handle_seed(records: &mut [Vec<Pair>], seed: &str) {
    for record in records.iter_mut() {
        let mut found = false;
        for (code, value) in record.iter_mut() {
            if found && *code == 5 {
                *value = seed.to_string();
                return;
            }
            found = *code == 9 && value.trim() == "$HANDSEED";
        }
    }
}

fn record_kind(record: &[Pair]) -> &str {
    match record.first() {
        Some((0, value)) => value.trim(),
        _ => "",
    }
}

fn value_of(record: &[Pair], code: i32) -> Option<&str> {
    record
        .iter()
        .find(|(pair_code, _)| *pair_code == code)
        .map(|(_, value)| value.trim())
}

fn xdict_of(record: &[Pair]) -> Option<String> {
    let mut in_xdict = false;
    for (code, value) in record {
        match code {
            102 => in_xdict = value.trim() == "{ACAD_XDICTIONARY",
            360 if in_xdict => return Some(value.trim().to_string()),
            _ => {}
        }
    }
    None
}

/// GEODATA 的宿主块记录：102 组之外的最后一个 330。
fn host_of(record: &[Pair]) -> Option<String> {
    let mut in_group = false;
    let mut host = None;
    for (code, value) in record {
        match code {
            102 => in_group = value.trim().starts_with('{'),
            330 if !in_group => host = Some(value.trim().to_string()),
            _ => {}
        }
    }
    host
}

fn parse_handle(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim(), 16).ok()
}
