use log::debug;
use serde_json::{json, Map, Value};

use std::{
    sync::{Arc, RwLock},
    time,
};

use crate::{
    index::lookup_field,
    store::{
        free_bucket, Collection, Extent, EXTENT_HEADER_SIZE, FREE_BUCKET_SIZES, PAGE_SIZE,
        RECORD_HEADER_SIZE,
    },
    util, Result,
};

/// Default chunk size is a hundredth of the analyzed area, bounded to
/// this range.
pub const MIN_GRANULARITY: usize = 4096;
pub const MAX_GRANULARITY: usize = 1024 * 1024;
/// Upper bound on the number of chunks an extent is split into.
pub const MAX_CHUNKS: usize = 10_000;

/// Kind of analysis performed on every extent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Analyze {
    /// Record and free-block layout, per extent and per chunk.
    DiskStorage,
    /// Bytes resident in memory, per extent and per chunk.
    PagesInRam,
    /// Ratio of resident pages per chunk.
    MemInCore,
}

/// Parameters for `diskStorageStats`, `pagesInRAM` and `storageDetails`.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyzeParams {
    /// Analyze a single extent, by ordinal.
    pub extent: Option<usize>,
    /// Byte range within the extent, only with `extent`.
    pub range: Option<(usize, usize)>,
    pub granularity: Option<usize>,
    /// Takes precedence over `granularity`.
    pub number_of_chunks: Option<usize>,
    /// Dotted path to the field that characterizes records.
    pub charact_field: String,
    /// Characteristic field holds an object-id, whose embedded timestamp is
    /// summarised as age in seconds.
    pub charact_is_obj_id: bool,
    pub show_records: bool,
}

impl Default for AnalyzeParams {
    fn default() -> AnalyzeParams {
        AnalyzeParams {
            extent: None,
            range: None,
            granularity: None,
            number_of_chunks: None,
            charact_field: "_id".to_string(),
            charact_is_obj_id: false,
            show_records: false,
        }
    }
}

fn to_count(cmd: &Value, field: &str) -> Result<Option<usize>> {
    match cmd.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(val) => match val.as_f64() {
            // float to integer casts saturate at usize::MAX.
            Some(n) if n.is_finite() && n >= 0.0 => Ok(Some(n as usize)),
            _ => err_at!(InvalidInput, msg: "{} must be a number", field),
        },
    }
}

impl AnalyzeParams {
    /// Parse `{extent?, range?, granularity?, numberOfChunks?, charactField?,
    /// showRecords?}`.
    pub fn from_command(cmd: &Value) -> Result<AnalyzeParams> {
        let mut params = AnalyzeParams {
            extent: to_count(cmd, "extent")?,
            granularity: to_count(cmd, "granularity")?,
            number_of_chunks: to_count(cmd, "numberOfChunks")?,
            ..AnalyzeParams::default()
        };
        if let Some(0) = params.granularity {
            err_at!(InvalidInput, msg: "granularity must be a positive number")?
        }
        if let Some(0) = params.number_of_chunks {
            err_at!(InvalidInput, msg: "numberOfChunks must be a positive number")?
        }

        params.range = match cmd.get("range") {
            None => None,
            Some(_) if params.extent.is_none() => {
                err_at!(InvalidInput, msg: "range is only allowed in combination with extent")?
            }
            Some(Value::Array(items)) if items.len() == 2 => {
                match (items[0].as_f64(), items[1].as_f64()) {
                    (Some(a), Some(b)) if a >= 0.0 && b > a => Some((a as usize, b as usize)),
                    (Some(_), Some(_)) => {
                        err_at!(InvalidInput, msg: "range must be a non-empty interval")?
                    }
                    _ => err_at!(
                        InvalidInput,
                        msg: "range must be an array with exactly two numeric elements"
                    )?,
                }
            }
            Some(_) => err_at!(
                InvalidInput,
                msg: "range must be an array with exactly two numeric elements"
            )?,
        };

        match cmd.get("charactField") {
            None => (),
            Some(Value::Object(obj)) => {
                match obj.get("name") {
                    Some(Value::String(name)) if !name.is_empty() => {
                        params.charact_field = name.clone()
                    }
                    _ => err_at!(InvalidInput, msg: "charactField must have a name")?,
                }
                match obj.get("isStdObjId") {
                    None => (),
                    Some(Value::Bool(val)) => params.charact_is_obj_id = *val,
                    Some(_) => err_at!(InvalidInput, msg: "isStdObjId must be a boolean")?,
                }
            }
            Some(_) => err_at!(InvalidInput, msg: "charactField must be an object")?,
        }

        params.show_records = match cmd.get("showRecords") {
            None => false,
            Some(Value::Bool(val)) => *val,
            Some(_) => err_at!(InvalidInput, msg: "showRecords must be a boolean")?,
        };

        Ok(params)
    }
}

/// Subdivision of an extent, or a range of it, into chunks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkParams {
    pub start: usize,
    pub end: usize,
    pub granularity: usize,
    pub number_of_chunks: usize,
    pub last_chunk_length: usize,
}

impl ChunkParams {
    pub fn new(extent_length: usize, params: &AnalyzeParams) -> Result<ChunkParams> {
        let (start, end) = match params.range {
            Some((start, end)) => (start, usize::min(end, extent_length)),
            None => (0, extent_length),
        };
        if start >= end {
            err_at!(
                InvalidInput, msg: "range {}..{} is outside the extent {}", start, end, extent_length
            )?
        }
        let length = end - start;

        let granularity = match (params.number_of_chunks, params.granularity) {
            (Some(n), _) => util::ceiling_div(length as u64, n as u64) as usize,
            (None, Some(granularity)) => granularity,
            (None, None) => usize::min(usize::max(length / 100, MIN_GRANULARITY), MAX_GRANULARITY),
        };
        let granularity = {
            let min = util::ceiling_div(length as u64, MAX_CHUNKS as u64) as usize;
            usize::min(usize::max(granularity, min), length)
        };
        let number_of_chunks = util::ceiling_div(length as u64, granularity as u64) as usize;
        let last_chunk_length = length - granularity * (number_of_chunks - 1);

        Ok(ChunkParams {
            start,
            end,
            granularity,
            number_of_chunks,
            last_chunk_length,
        })
    }

    pub fn to_length(&self) -> usize {
        self.end - self.start
    }

    fn to_chunk(&self, chunk: usize) -> (usize, usize) {
        let start = usize::min(
            self.start.saturating_add(chunk.saturating_mul(self.granularity)),
            self.end,
        );
        (start, usize::min(start.saturating_add(self.granularity), self.end))
    }

    /// Chunks overlapped by `ofs..ofs+length`, as `(chunk, bytes)`.
    pub fn to_overlaps(&self, ofs: usize, length: usize) -> Vec<(usize, usize)> {
        let s = usize::max(ofs, self.start);
        let e = usize::min(ofs.saturating_add(length), self.end);
        if s >= e {
            return vec![];
        }

        let first = (s - self.start) / self.granularity;
        let last = usize::min((e - 1 - self.start) / self.granularity, self.number_of_chunks - 1);
        (first..=last)
            .map(|chunk| {
                let (cs, ce) = self.to_chunk(chunk);
                (chunk, usize::min(e, ce) - usize::max(s, cs))
            })
            .collect()
    }
}

// Aggregates for a chunk or an extent.
#[derive(Clone, Debug)]
struct DiskStorageData {
    num_entries: f64,
    bson_size: f64,
    rec_size: u64,
    on_disk_size: u64,
    charact_sum: f64,
    charact_count: f64,
    free_recs: Vec<f64>,
}

impl DiskStorageData {
    fn new(on_disk_size: usize) -> DiskStorageData {
        DiskStorageData {
            num_entries: 0.0,
            bson_size: 0.0,
            rec_size: 0,
            on_disk_size: on_disk_size as u64,
            charact_sum: 0.0,
            charact_count: 0.0,
            free_recs: vec![0.0; FREE_BUCKET_SIZES.len()],
        }
    }

    fn add(&mut self, other: &DiskStorageData) {
        self.num_entries += other.num_entries;
        self.bson_size += other.bson_size;
        self.rec_size += other.rec_size;
        self.on_disk_size += other.on_disk_size;
        self.charact_sum += other.charact_sum;
        self.charact_count += other.charact_count;
        for (a, b) in self.free_recs.iter_mut().zip(other.free_recs.iter()) {
            *a += b;
        }
    }

    fn append_to(&self, map: &mut Map<String, Value>) {
        map.insert("numEntries".to_string(), json!(self.num_entries));
        map.insert("bsonSize".to_string(), json!(self.bson_size.round() as u64));
        map.insert("recSize".to_string(), json!(self.rec_size));
        map.insert("onDiskSize".to_string(), json!(self.on_disk_size));
        if self.charact_count > 0.0 {
            map.insert("charactSum".to_string(), json!(self.charact_sum));
            map.insert("charactCount".to_string(), json!(self.charact_count));
        }
        map.insert("freeRecsPerBucket".to_string(), json!(self.free_recs));
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        self.append_to(&mut map);
        Value::Object(map)
    }
}

/// Walk extents of a collection and compute per extent and per chunk
/// statistics. Extents are read-locked one at a time, and the walk never
/// changes page residency.
pub struct Walker {
    coll: Arc<Collection>,
    analyze: Analyze,
    params: AnalyzeParams,
    // seconds since epoch, when the walk started.
    now: f64,
}

impl Walker {
    pub fn new(coll: Arc<Collection>, analyze: Analyze, params: AnalyzeParams) -> Result<Walker> {
        if analyze == Analyze::DiskStorage && coll.is_capped() {
            err_at!(Unsupported, msg: "capped collections are not supported")?
        }
        if let Some(num) = params.extent {
            if num >= coll.read_storage()?.len_extents() {
                err_at!(NotFound, msg: "extent {} does not exist", num)?
            }
        }

        let now = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Ok(Walker {
            coll,
            analyze,
            params,
            now,
        })
    }

    /// Stream one extent report at a time.
    pub fn iter(&self) -> Result<Iter> {
        let extents = self.coll.to_extents()?;
        let extents = match self.params.extent {
            Some(num) => extents.into_iter().skip(num).take(1).collect(),
            None => extents,
        };
        Ok(Iter {
            walker: self,
            extents: extents.into_iter(),
        })
    }

    /// Return the full response, `{ok, ..., extents}`.
    pub fn to_json(&self) -> Result<Value> {
        let mut extents = vec![];
        for report in self.iter()? {
            extents.push(report?);
        }

        let storage = self.coll.read_storage()?;
        let val = match self.analyze {
            Analyze::DiskStorage => json!({
                "ok": 1,
                "storageSize": storage.to_storage_size(),
                "numExtents": storage.len_extents(),
                "extents": extents,
            }),
            Analyze::PagesInRam | Analyze::MemInCore => json!({
                "ok": 1,
                "pageSize": PAGE_SIZE,
                "numExtents": storage.len_extents(),
                "extents": extents,
            }),
        };
        Ok(val)
    }

    fn analyze_extent(&self, extent: &Extent) -> Result<Value> {
        let cp = ChunkParams::new(extent.to_length(), &self.params)?;
        debug!(
            target: "diag",
            "{}, {} split into {} chunks of {}",
            self.coll, extent, cp.number_of_chunks, cp.granularity
        );

        match self.analyze {
            Analyze::DiskStorage => self.disk_storage(extent, &cp),
            Analyze::PagesInRam => Ok(pages_in_ram(extent, &cp)),
            Analyze::MemInCore => Ok(mem_in_core(extent, &cp)),
        }
    }

    fn disk_storage(&self, extent: &Extent, cp: &ChunkParams) -> Result<Value> {
        let mut chunks: Vec<DiskStorageData> = (0..cp.number_of_chunks)
            .map(|chunk| {
                let (cs, ce) = cp.to_chunk(chunk);
                DiskStorageData::new(ce - cs)
            })
            .collect();
        let (mut records, mut free_records) = (vec![], vec![]);

        for (ofs, record) in extent.iter_records() {
            let overlaps = cp.to_overlaps(*ofs, record.length);
            if overlaps.is_empty() {
                continue;
            }

            let charact = self.to_charact(&record.doc);
            for (chunk, size) in overlaps.into_iter() {
                let ratio = size as f64 / record.length as f64;
                let data = &mut chunks[chunk];
                data.num_entries += ratio;
                data.rec_size += size as u64;
                data.bson_size += ratio * record.bson_size as f64;
                if let Some(val) = charact {
                    data.charact_count += ratio;
                    data.charact_sum += ratio * val;
                }
            }

            if self.params.show_records {
                let mut item = json!({
                    "ofs": ofs,
                    "recSize": record.length,
                    "bsonSize": record.bson_size,
                    "id": record.doc.get("_id").cloned().unwrap_or(Value::Null),
                });
                if let Some(val) = charact {
                    item["charact"] = json!(val);
                }
                records.push(item);
            }
        }

        for (ofs, length) in extent.iter_free() {
            let overlaps = cp.to_overlaps(ofs, length);
            if overlaps.is_empty() {
                continue;
            }
            let bucket = free_bucket(length);
            for (chunk, size) in overlaps.into_iter() {
                chunks[chunk].free_recs[bucket] += size as f64 / length as f64;
            }
            if self.params.show_records {
                free_records.push(json!({"ofs": ofs, "recSize": length}));
            }
        }

        let mut total = DiskStorageData::new(0);
        chunks.iter().for_each(|chunk| total.add(chunk));

        let mut map = Map::new();
        map.insert("extentHeaderSize".to_string(), json!(EXTENT_HEADER_SIZE));
        map.insert("recordHeaderSize".to_string(), json!(RECORD_HEADER_SIZE));
        map.insert("range".to_string(), json!([cp.start, cp.end]));
        total.append_to(&mut map);
        map.insert("outOfOrderRecs".to_string(), json!(extent.to_out_of_order()));
        let chunks: Vec<Value> = chunks.iter().map(|c| c.to_json()).collect();
        map.insert("chunks".to_string(), Value::Array(chunks));
        if self.params.show_records {
            map.insert("records".to_string(), Value::Array(records));
            map.insert("deletedRecords".to_string(), Value::Array(free_records));
        }

        Ok(Value::Object(map))
    }

    fn to_charact(&self, doc: &Value) -> Option<f64> {
        let val = lookup_field(doc, &self.params.charact_field)?;
        if self.params.charact_is_obj_id {
            // leading 4 bytes of an object-id are its creation time.
            let hex = val.as_str().filter(|s| s.len() == 24)?;
            let secs = u32::from_str_radix(hex.get(..8)?, 16).ok()?;
            Some(self.now - secs as f64)
        } else {
            val.as_f64()
        }
    }
}

/// Iterator over extent reports, see [Walker::iter].
pub struct Iter<'a> {
    walker: &'a Walker,
    extents: std::vec::IntoIter<Arc<RwLock<Extent>>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let extent = self.extents.next()?;
        let res = match extent.read() {
            Ok(extent) => self.walker.analyze_extent(&extent),
            Err(err) => err_at!(Fatal, msg: "extent lock poisoned: {}", err),
        };
        Some(res)
    }
}

fn pages_in_ram(extent: &Extent, cp: &ChunkParams) -> Value {
    let chunks: Vec<usize> = (0..cp.number_of_chunks)
        .map(|chunk| {
            let (cs, ce) = cp.to_chunk(chunk);
            extent.to_resident_bytes(cs, ce)
        })
        .collect();
    let n_pages = (cp.start / PAGE_SIZE..=(cp.end - 1) / PAGE_SIZE).count();

    json!({
        "pageSize": PAGE_SIZE,
        "pageBytes": n_pages * PAGE_SIZE,
        "onDiskSize": cp.to_length(),
        "inMem": chunks.iter().sum::<usize>(),
        "chunks": chunks,
    })
}

fn mem_in_core(extent: &Extent, cp: &ChunkParams) -> Value {
    let chunks: Vec<f64> = (0..cp.number_of_chunks)
        .map(|chunk| {
            let (cs, ce) = cp.to_chunk(chunk);
            let pages = cs / PAGE_SIZE..=(ce - 1) / PAGE_SIZE;
            let n_pages = pages.clone().count();
            let n_resident = pages.filter(|page| extent.is_resident(*page)).count();
            n_resident as f64 / n_pages as f64
        })
        .collect();

    json!({"pageSize": PAGE_SIZE, "chunks": chunks})
}

/// Handle `diskStorageStats`.
pub fn disk_storage_stats(coll: Arc<Collection>, cmd: &Value) -> Result<Value> {
    let params = AnalyzeParams::from_command(cmd)?;
    Walker::new(coll, Analyze::DiskStorage, params)?.to_json()
}

/// Handle `pagesInRAM`.
pub fn pages_in_ram_stats(coll: Arc<Collection>, cmd: &Value) -> Result<Value> {
    let params = AnalyzeParams::from_command(cmd)?;
    Walker::new(coll, Analyze::PagesInRam, params)?.to_json()
}

/// Handle `storageDetails {analyze: 'diskStorage' | 'memInCore', extent,
/// granularity | numberOfChunks, ...}`, for a single extent.
pub fn storage_details(coll: Arc<Collection>, cmd: &Value) -> Result<Value> {
    let analyze = match cmd.get("analyze") {
        Some(Value::String(s)) if s == "diskStorage" => Analyze::DiskStorage,
        Some(Value::String(s)) if s == "memInCore" => Analyze::MemInCore,
        Some(val) => err_at!(
            InvalidInput,
            msg: "{} is not a valid subcommand, use 'diskStorage' or 'memInCore'", val
        )?,
        None => err_at!(
            InvalidInput,
            msg: "no subcommand specified, use {{analyze: 'diskStorage' | 'memInCore'}}"
        )?,
    };

    let params = AnalyzeParams::from_command(cmd)?;
    if params.extent.is_none() {
        err_at!(InvalidInput, msg: "no extent specified, use {{extent: extentNum}}")?
    }
    if params.granularity.is_none() && params.number_of_chunks.is_none() {
        err_at!(
            InvalidInput,
            msg: "either granularity or numberOfChunks must be specified in options"
        )?
    }

    let walker = Walker::new(coll, analyze, params)?;
    let report = match walker.iter()?.next() {
        Some(report) => report?,
        None => err_at!(NotFound, msg: "extent does not exist")?,
    };

    let mut map = Map::new();
    map.insert("ok".to_string(), json!(1));
    if let Value::Object(items) = report {
        map.extend(items.into_iter());
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
#[path = "storage_details_test.rs"]
mod storage_details_test;
