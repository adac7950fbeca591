//! The default codec.
//!
//! Every file is a structured file (header, body, CRC32 footer). Segment
//! data and doc-values updates are bincode payloads, segment descriptions
//! and manifests are JSON so they stay readable with standard tools.

use std::collections::BTreeSet;

use crate::codec::compound::{CompoundReader, write_compound};
use crate::codec::{Codec, SegmentData};
use crate::error::{Result, TesseraError};
use crate::index::doc_values::DocValuesOverlay;
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::segment_infos::SegmentInfos;
use crate::index::{
    COMPOUND_FILE_EXTENSION, DV_UPDATES_EXTENSION, LIVE_DOCS_EXTENSION, SEGMENT_DATA_EXTENSION,
    SEGMENT_INFO_EXTENSION, file_name_from_generation, segment_file_name,
};
use crate::storage::Storage;
use crate::storage::read_file;
use crate::storage::structured::{StructReader, StructWriter, read_checked, verify_footer};

/// Name under which segments written by [`DefaultCodec`] are recorded.
pub const CODEC_NAME: &str = "default";

const SEGMENT_MAGIC: u32 = 0x5453_4547; // "TSEG"
const SEGMENT_INFO_MAGIC: u32 = 0x5453_5349; // "TSSI"
const LIVE_DOCS_MAGIC: u32 = 0x544C_4956; // "TLIV"
const DV_UPDATES_MAGIC: u32 = 0x5444_5655; // "TDVU"
const SEGMENT_INFOS_MAGIC: u32 = 0x5453_4953; // "TSIS"

const VERSION: u32 = 1;

/// Bincode segment data framed by structured files.
#[derive(Debug, Clone, Default)]
pub struct DefaultCodec;

impl DefaultCodec {
    /// Create the codec.
    pub fn new() -> Self {
        DefaultCodec
    }

    fn check_id(reader_id: &str, info_id: &str, file_name: &str) -> Result<()> {
        if reader_id != info_id {
            return Err(TesseraError::corrupt(format!(
                "{file_name}: segment id {reader_id} does not match {info_id}"
            )));
        }
        Ok(())
    }
}

impl Codec for DefaultCodec {
    fn name(&self) -> &str {
        CODEC_NAME
    }

    fn write_segment(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        data: &SegmentData,
    ) -> Result<BTreeSet<String>> {
        let file_name = segment_file_name(&info.name, SEGMENT_DATA_EXTENSION);
        let payload = bincode::serialize(data)?;

        let mut writer = StructWriter::create(storage, &file_name)?;
        writer.write_header(SEGMENT_MAGIC, VERSION)?;
        writer.write_string(&info.id)?;
        writer.write_bytes(&payload)?;
        writer.close()?;

        Ok(BTreeSet::from([file_name]))
    }

    fn read_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentData> {
        let file_name = segment_file_name(&info.name, SEGMENT_DATA_EXTENSION);
        let mut bytes = if info.use_compound_file {
            let cfs = segment_file_name(&info.name, COMPOUND_FILE_EXTENSION);
            CompoundReader::open(storage, &cfs)?.take(&file_name)?
        } else {
            read_file(storage, &file_name)?
        };
        let body_len = verify_footer(&bytes, &file_name)?;
        bytes.truncate(body_len);

        let mut reader = StructReader::from_slice(&bytes, &file_name);
        reader.read_header(SEGMENT_MAGIC, VERSION, VERSION)?;
        Self::check_id(&reader.read_string()?, &info.id, &file_name)?;
        let data: SegmentData = bincode::deserialize(&reader.read_bytes()?)?;
        if data.max_doc != info.max_doc {
            return Err(TesseraError::corrupt(format!(
                "{file_name}: holds {} docs, segment info says {}",
                data.max_doc, info.max_doc
            )));
        }
        Ok(data)
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<String> {
        let file_name = segment_file_name(&info.name, SEGMENT_INFO_EXTENSION);
        let mut writer = StructWriter::create(storage, &file_name)?;
        writer.write_header(SEGMENT_INFO_MAGIC, VERSION)?;
        writer.write_string(&serde_json::to_string(info)?)?;
        writer.close()?;
        Ok(file_name)
    }

    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo> {
        let file_name = segment_file_name(segment, SEGMENT_INFO_EXTENSION);
        let body = read_checked(storage, &file_name)?;
        let mut reader = StructReader::from_slice(&body, &file_name);
        reader.read_header(SEGMENT_INFO_MAGIC, VERSION, VERSION)?;
        Ok(serde_json::from_str(&reader.read_string()?)?)
    }

    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        files: &BTreeSet<String>,
    ) -> Result<String> {
        let cfs = segment_file_name(&info.name, COMPOUND_FILE_EXTENSION);
        let files: Vec<String> = files.iter().cloned().collect();
        write_compound(storage, &cfs, &files)?;
        Ok(cfs)
    }

    fn segment_files(&self, info: &SegmentInfo) -> BTreeSet<String> {
        let data = if info.use_compound_file {
            COMPOUND_FILE_EXTENSION
        } else {
            SEGMENT_DATA_EXTENSION
        };
        BTreeSet::from([
            segment_file_name(&info.name, data),
            segment_file_name(&info.name, SEGMENT_INFO_EXTENSION),
        ])
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String> {
        let file_name = file_name_from_generation(info.name(), LIVE_DOCS_EXTENSION, generation)
            .ok_or_else(|| TesseraError::illegal_argument("invalid live docs generation"))?;
        let mut writer = StructWriter::create(storage, &file_name)?;
        writer.write_header(LIVE_DOCS_MAGIC, VERSION)?;
        writer.write_string(&info.info.id)?;
        writer.write_varint(live_docs.max_doc() as u64)?;
        writer.write_varint(live_docs.num_deleted() as u64)?;
        writer.write_bytes(&live_docs.to_bytes())?;
        writer.close()?;
        Ok(file_name)
    }

    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<Option<LiveDocs>> {
        let Some(file_name) = info.live_docs_file_name() else {
            return Ok(None);
        };
        let body = read_checked(storage, &file_name)?;
        let mut reader = StructReader::from_slice(&body, &file_name);
        reader.read_header(LIVE_DOCS_MAGIC, VERSION, VERSION)?;
        Self::check_id(&reader.read_string()?, &info.info.id, &file_name)?;
        let max_doc = reader.read_varint()? as u32;
        let del_count = reader.read_varint()? as u32;
        let live_docs = LiveDocs::from_bytes(&reader.read_bytes()?, max_doc)?;
        if max_doc != info.info.max_doc || live_docs.num_deleted() != del_count {
            return Err(TesseraError::corrupt(format!(
                "{file_name}: {} deletions over {max_doc} docs, expected {del_count} over {}",
                live_docs.num_deleted(),
                info.info.max_doc
            )));
        }
        Ok(Some(live_docs))
    }

    fn write_doc_values_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        overlay: &DocValuesOverlay,
        generation: i64,
    ) -> Result<String> {
        let file_name = file_name_from_generation(info.name(), DV_UPDATES_EXTENSION, generation)
            .ok_or_else(|| TesseraError::illegal_argument("invalid doc values generation"))?;
        let mut writer = StructWriter::create(storage, &file_name)?;
        writer.write_header(DV_UPDATES_MAGIC, VERSION)?;
        writer.write_string(&info.info.id)?;
        writer.write_bytes(&bincode::serialize(overlay)?)?;
        writer.close()?;
        Ok(file_name)
    }

    fn read_doc_values_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<DocValuesOverlay> {
        let Some(file_name) = info.dv_updates_file_name() else {
            return Ok(DocValuesOverlay::new());
        };
        let body = read_checked(storage, &file_name)?;
        let mut reader = StructReader::from_slice(&body, &file_name);
        reader.read_header(DV_UPDATES_MAGIC, VERSION, VERSION)?;
        Self::check_id(&reader.read_string()?, &info.info.id, &file_name)?;
        Ok(bincode::deserialize(&reader.read_bytes()?)?)
    }

    fn write_segment_infos(
        &self,
        storage: &dyn Storage,
        infos: &SegmentInfos,
        file_name: &str,
    ) -> Result<()> {
        let mut writer = StructWriter::create(storage, file_name)?;
        writer.write_header(SEGMENT_INFOS_MAGIC, VERSION)?;
        writer.write_string(&serde_json::to_string(infos)?)?;
        writer.close()?;
        Ok(())
    }

    fn read_segment_infos(&self, storage: &dyn Storage, file_name: &str) -> Result<SegmentInfos> {
        let body = read_checked(storage, file_name)?;
        let mut reader = StructReader::from_slice(&body, file_name);
        reader.read_header(SEGMENT_INFOS_MAGIC, VERSION, VERSION)?;
        Ok(serde_json::from_str(&reader.read_string()?)?)
    }
}
