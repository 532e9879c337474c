//! Fixed-size job and node records.

use drover_types::{
    Buildable, Crc, Crunch, Ddate, FileSig, FileTag, Pdate, RunStatus, Status, Tflags,
};

use crate::recfile::FixedRecord;

// ---------------------------------------------------------------------------
// Status byte codecs
// ---------------------------------------------------------------------------

fn status_to_u8(s: Status) -> u8 {
    match s {
        Status::New => 0,
        Status::Lost => 1,
        Status::Killed => 2,
        Status::ChkDeps => 3,
        Status::Garbage => 4,
        Status::Ok => 5,
        Status::Frozen => 6,
        Status::Err => 7,
        Status::ErrFrozen => 8,
        Status::Timeout => 9,
        Status::SystemErr => 10,
    }
}

fn status_from_u8(b: u8) -> Status {
    match b {
        1 => Status::Lost,
        2 => Status::Killed,
        3 => Status::ChkDeps,
        4 => Status::Garbage,
        5 => Status::Ok,
        6 => Status::Frozen,
        7 => Status::Err,
        8 => Status::ErrFrozen,
        9 => Status::Timeout,
        10 => Status::SystemErr,
        _ => Status::New,
    }
}

fn run_status_to_u8(s: RunStatus) -> u8 {
    match s {
        RunStatus::Complete => 0,
        RunStatus::NoDep => 1,
        RunStatus::NoFile => 2,
        RunStatus::TargetErr => 3,
        RunStatus::DepErr => 4,
        RunStatus::RsrcsErr => 5,
    }
}

fn run_status_from_u8(b: u8) -> RunStatus {
    match b {
        1 => RunStatus::NoDep,
        2 => RunStatus::NoFile,
        3 => RunStatus::TargetErr,
        4 => RunStatus::DepErr,
        5 => RunStatus::RsrcsErr,
        _ => RunStatus::Complete,
    }
}

fn buildable_to_u8(b: Buildable) -> u8 {
    match b {
        Buildable::Unknown => 0,
        Buildable::Src => 1,
        Buildable::SrcDir => 2,
        Buildable::SubSrc => 3,
        Buildable::SubSrcDir => 4,
        Buildable::Anti => 5,
        Buildable::Yes => 6,
        Buildable::No => 7,
        Buildable::Maybe => 8,
        Buildable::Loop => 9,
        Buildable::LongName => 10,
        Buildable::Decode => 11,
        Buildable::Encode => 12,
    }
}

fn buildable_from_u8(b: u8) -> Buildable {
    match b {
        1 => Buildable::Src,
        2 => Buildable::SrcDir,
        3 => Buildable::SubSrc,
        4 => Buildable::SubSrcDir,
        5 => Buildable::Anti,
        6 => Buildable::Yes,
        7 => Buildable::No,
        8 => Buildable::Maybe,
        9 => Buildable::Loop,
        10 => Buildable::LongName,
        11 => Buildable::Decode,
        12 => Buildable::Encode,
        _ => Buildable::Unknown,
    }
}

pub(crate) fn crc_to_bytes(crc: Crc, buf: &mut [u8]) {
    let (tag, hash): (u8, u128) = match crc {
        Crc::None => (0, 0),
        Crc::Empty => (1, 0),
        Crc::Unknown => (2, 0),
        Crc::Lnk(h) => (3, h),
        Crc::Reg(h) => (4, h),
        Crc::Val(h) => (5, h),
    };
    buf[0] = tag;
    buf[1..17].copy_from_slice(&hash.to_le_bytes());
}

pub(crate) fn crc_from_bytes(buf: &[u8]) -> Crc {
    let hash = u128::from_le_bytes(buf[1..17].try_into().expect("16 bytes"));
    match buf[0] {
        0 => Crc::None,
        1 => Crc::Empty,
        3 => Crc::Lnk(hash),
        4 => Crc::Reg(hash),
        5 => Crc::Val(hash),
        _ => Crc::Unknown,
    }
}

fn sig_to_bytes(sig: &FileSig, buf: &mut [u8]) {
    buf[0] = match sig.tag {
        FileTag::None => 0,
        FileTag::Reg => 1,
        FileTag::Exe => 2,
        FileTag::Lnk => 3,
        FileTag::Dir => 4,
    };
    buf[1..9].copy_from_slice(&sig.inode.to_le_bytes());
    buf[9..17].copy_from_slice(&sig.mtime.0.to_le_bytes());
    buf[17..25].copy_from_slice(&sig.size.to_le_bytes());
}

fn sig_from_bytes(buf: &[u8]) -> FileSig {
    FileSig {
        tag: match buf[0] {
            1 => FileTag::Reg,
            2 => FileTag::Exe,
            3 => FileTag::Lnk,
            4 => FileTag::Dir,
            _ => FileTag::None,
        },
        inode: u64::from_le_bytes(buf[1..9].try_into().expect("8 bytes")),
        mtime: Ddate(u64::from_le_bytes(buf[9..17].try_into().expect("8 bytes"))),
        size: u64::from_le_bytes(buf[17..25].try_into().expect("8 bytes")),
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Fixed-size job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRecord {
    pub rule: u32,
    pub name: u32,
    /// Dep vector index (0 = no deps recorded yet).
    pub deps: u32,
    /// Star targets, crunch-encoded: empty, one inline node (with the
    /// default `Target` tflag), or a target-vector index.
    pub star_targets: Crunch,
    pub status: Status,
    pub run_status: RunStatus,
    /// Parallel tokens consumed minus one.
    pub tokens1: u8,
    pub exec_gen: u32,
    pub match_gen: u32,
    pub exec_time_ns: u64,
    /// Oldest on-disk date at which this job's recorded state is coherent.
    pub db_date: u64,
}

impl JobRecord {
    #[must_use]
    pub fn new(rule: u32, name: u32) -> Self {
        Self {
            rule,
            name,
            deps: 0,
            star_targets: Crunch::Empty,
            status: Status::New,
            run_status: RunStatus::Complete,
            tokens1: 0,
            exec_gen: 0,
            match_gen: 0,
            exec_time_ns: 0,
            db_date: 0,
        }
    }
}

impl FixedRecord for JobRecord {
    const SIZE: usize = 44;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.rule.to_le_bytes());
        buf[4..8].copy_from_slice(&self.name.to_le_bytes());
        buf[8..12].copy_from_slice(&self.deps.to_le_bytes());
        buf[12..16].copy_from_slice(&self.star_targets.encode().to_le_bytes());
        buf[16] = status_to_u8(self.status);
        buf[17] = run_status_to_u8(self.run_status);
        buf[18] = self.tokens1;
        buf[19] = 0;
        buf[20..24].copy_from_slice(&self.exec_gen.to_le_bytes());
        buf[24..28].copy_from_slice(&self.match_gen.to_le_bytes());
        buf[28..36].copy_from_slice(&self.exec_time_ns.to_le_bytes());
        buf[36..44].copy_from_slice(&self.db_date.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            rule: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            name: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            deps: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            star_targets: Crunch::decode(u32::from_le_bytes(
                buf[12..16].try_into().expect("4 bytes"),
            )),
            status: status_from_u8(buf[16]),
            run_status: run_status_from_u8(buf[17]),
            tokens1: buf[18],
            exec_gen: u32::from_le_bytes(buf[20..24].try_into().expect("4 bytes")),
            match_gen: u32::from_le_bytes(buf[24..28].try_into().expect("4 bytes")),
            exec_time_ns: u64::from_le_bytes(buf[28..36].try_into().expect("8 bytes")),
            db_date: u64::from_le_bytes(buf[36..44].try_into().expect("8 bytes")),
        }
    }
}

// ---------------------------------------------------------------------------
// Node record
// ---------------------------------------------------------------------------

/// Sentinel values for [`NodeRecord::conform`] when no candidate job index
/// applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformIdx {
    /// Index into the node's `job_tgts` candidate vector.
    JobTgt(u32),
    /// Node is a source.
    Src,
    /// Node is (under) a source dir.
    SrcDir,
    /// Several jobs claim the node at equal priority.
    Multi,
    /// No candidate produces the node.
    None,
    /// The node's dir is itself buildable; the node is implied by it.
    Uphill,
    /// The node's dir is currently a file or link; writes are dangling.
    Transcient,
}

impl ConformIdx {
    fn to_i32(self) -> i32 {
        match self {
            ConformIdx::JobTgt(i) => i32::try_from(i).unwrap_or(i32::MAX),
            ConformIdx::Src => -1,
            ConformIdx::SrcDir => -2,
            ConformIdx::Multi => -3,
            ConformIdx::None => -4,
            ConformIdx::Uphill => -5,
            ConformIdx::Transcient => -6,
        }
    }

    fn from_i32(v: i32) -> Self {
        match v {
            -1 => ConformIdx::Src,
            -2 => ConformIdx::SrcDir,
            -3 => ConformIdx::Multi,
            -5 => ConformIdx::Uphill,
            -6 => ConformIdx::Transcient,
            v if v >= 0 => ConformIdx::JobTgt(u32::try_from(v).unwrap_or(0)),
            _ => ConformIdx::None,
        }
    }
}

/// Fixed-size node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: u32,
    /// Parent dir node (0 = none, i.e. a top-level name).
    pub dir: u32,
    /// Job that last wrote this node (0 = none).
    pub actual_job: u32,
    pub actual_tflags: Tflags,
    /// Candidate producing jobs, crunch-encoded, decreasing priority.
    pub job_tgts: Crunch,
    /// How many rule-target candidates have been consumed by lazy matching.
    pub rule_tgts_pos: u32,
    pub crc: Crc,
    /// When `crc` was computed.
    pub date: Pdate,
    /// On-disk signature at which `crc` was computed.
    pub sig: FileSig,
    pub buildable: Buildable,
    pub conform: ConformIdx,
    pub match_gen: u32,
}

impl NodeRecord {
    #[must_use]
    pub fn new(name: u32, dir: u32) -> Self {
        Self {
            name,
            dir,
            actual_job: 0,
            actual_tflags: Tflags::empty(),
            job_tgts: Crunch::Empty,
            rule_tgts_pos: 0,
            crc: Crc::Unknown,
            date: Pdate::NONE,
            sig: FileSig::default(),
            buildable: Buildable::Unknown,
            conform: ConformIdx::None,
            match_gen: 0,
        }
    }
}

impl FixedRecord for NodeRecord {
    const SIZE: usize = 81;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.name.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dir.to_le_bytes());
        buf[8..12].copy_from_slice(&self.actual_job.to_le_bytes());
        buf[12..14].copy_from_slice(&self.actual_tflags.bits().to_le_bytes());
        buf[14..18].copy_from_slice(&self.job_tgts.encode().to_le_bytes());
        buf[18..22].copy_from_slice(&self.rule_tgts_pos.to_le_bytes());
        crc_to_bytes(self.crc, &mut buf[22..39]);
        buf[39..47].copy_from_slice(&self.date.0.to_le_bytes());
        sig_to_bytes(&self.sig, &mut buf[47..72]);
        buf[72] = buildable_to_u8(self.buildable);
        buf[73..77].copy_from_slice(&self.conform.to_i32().to_le_bytes());
        buf[77..81].copy_from_slice(&self.match_gen.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            name: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            dir: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            actual_job: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            actual_tflags: Tflags::from_bits_truncate(u16::from_le_bytes(
                buf[12..14].try_into().expect("2 bytes"),
            )),
            job_tgts: Crunch::decode(u32::from_le_bytes(buf[14..18].try_into().expect("4 bytes"))),
            rule_tgts_pos: u32::from_le_bytes(buf[18..22].try_into().expect("4 bytes")),
            crc: crc_from_bytes(&buf[22..39]),
            date: Pdate(u64::from_le_bytes(buf[39..47].try_into().expect("8 bytes"))),
            sig: sig_from_bytes(&buf[47..72]),
            buildable: buildable_from_u8(buf[72]),
            conform: ConformIdx::from_i32(i32::from_le_bytes(
                buf[73..77].try_into().expect("4 bytes"),
            )),
            match_gen: u32::from_le_bytes(buf[77..81].try_into().expect("4 bytes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::NodeIdx;

    #[test]
    fn test_job_record_round_trip() {
        let mut rec = JobRecord::new(3, 17);
        rec.deps = 9;
        rec.star_targets = Crunch::One(NodeIdx::new(21).expect("idx").get());
        rec.status = Status::Ok;
        rec.run_status = RunStatus::DepErr;
        rec.tokens1 = 3;
        rec.exec_gen = 2;
        rec.match_gen = 5;
        rec.exec_time_ns = 1234;
        rec.db_date = 999;
        let mut buf = [0u8; JobRecord::SIZE];
        rec.encode(&mut buf);
        assert_eq!(JobRecord::decode(&buf), rec);
    }

    #[test]
    fn test_node_record_round_trip() {
        let mut rec = NodeRecord::new(8, 2);
        rec.actual_job = 4;
        rec.actual_tflags = Tflags::from_bits_truncate(0b101);
        rec.job_tgts = Crunch::One(12);
        rec.rule_tgts_pos = 2;
        rec.crc = Crc::Reg(0xDEAD_BEEF_0123);
        rec.date = Pdate(777);
        rec.sig = FileSig {
            tag: FileTag::Exe,
            inode: 55,
            mtime: Ddate(888),
            size: 4096,
        };
        rec.buildable = Buildable::Yes;
        rec.conform = ConformIdx::JobTgt(0);
        rec.match_gen = 6;
        let mut buf = [0u8; NodeRecord::SIZE];
        rec.encode(&mut buf);
        assert_eq!(NodeRecord::decode(&buf), rec);
    }

    #[test]
    fn test_conform_sentinels_round_trip() {
        for c in [
            ConformIdx::JobTgt(0),
            ConformIdx::JobTgt(7),
            ConformIdx::Src,
            ConformIdx::SrcDir,
            ConformIdx::Multi,
            ConformIdx::None,
            ConformIdx::Uphill,
            ConformIdx::Transcient,
        ] {
            assert_eq!(ConformIdx::from_i32(c.to_i32()), c);
        }
    }

    #[test]
    fn test_status_bytes_cover_all_variants() {
        for s in [
            Status::New,
            Status::Lost,
            Status::Killed,
            Status::ChkDeps,
            Status::Garbage,
            Status::Ok,
            Status::Frozen,
            Status::Err,
            Status::ErrFrozen,
            Status::Timeout,
            Status::SystemErr,
        ] {
            assert_eq!(status_from_u8(status_to_u8(s)), s);
        }
    }
}
