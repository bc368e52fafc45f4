//! Userspace side of the kernel/userspace map contract (C8): open the
//! compiled probe object, load and attach its programs, and drain its
//! aggregation maps on a `ProbeHandle` that enforces
//! `Opened -> Loaded -> Attached -> (map ops) -> Destroyed`.

use std::collections::HashMap as StdHashMap;
use std::path::{Path, PathBuf};

use aya::maps::{HashMap as AyaHashMap, LruHashMap, MapData, PerCpuArray};
use aya::programs::{KProbe, RawTracePoint, TracePoint};
use aya::{Ebpf, EbpfLoader};
use log::{debug, info, warn};

use cgtel_common::{
    map_names, map_stat, CgroupKey, CounterValue, HistogramValue, SyscallKey, SyscallStats,
    TcpStats,
};

use crate::error::{LoadError, MapError};

const MAX_ATTACH_PROGRAMS: usize = 32;

// `cgtel_common`'s value types derive `bytemuck::Pod` for the kernel side,
// which aya's userspace map wrappers don't recognize — they bound on their
// own `aya::Pod` marker instead (the same reason `cognitod` hand-writes
// `unsafe impl Pod for TelemetryConfigPod` for its global config struct).
// All six types are `#[repr(C)]`, `Copy`, and carry no padding bytes that
// aren't already zeroed by `Zeroable`, so the unsafe contract holds.
unsafe impl aya::Pod for CgroupKey {}
unsafe impl aya::Pod for SyscallKey {}
unsafe impl aya::Pod for CounterValue {}
unsafe impl aya::Pod for HistogramValue {}
unsafe impl aya::Pod for TcpStats {}
unsafe impl aya::Pod for SyscallStats {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Opened,
    Loaded,
    Attached,
    Destroyed,
}

impl HandleState {
    fn label(self) -> &'static str {
        match self {
            HandleState::Opened => "opened",
            HandleState::Loaded => "loaded",
            HandleState::Attached => "attached",
            HandleState::Destroyed => "destroyed",
        }
    }
}

enum ProgramKind {
    KProbe(&'static str),
    TracePoint(&'static str, &'static str),
    RawTracePoint(&'static str),
}

struct ProgramSpec {
    name: &'static str,
    kind: ProgramKind,
    /// Best-effort: a failure to attach is logged and skipped rather than
    /// propagated. `tcp_probe` is the one tracepoint here that depends on a
    /// kernel-version-sensitive raw layout (see cgtel-ebpf-probes), so it is
    /// the one probe this loader tolerates losing.
    optional: bool,
}

const PROGRAMS: &[ProgramSpec] = &[
    ProgramSpec {
        name: "sched_wakeup",
        kind: ProgramKind::TracePoint("sched", "sched_wakeup"),
        optional: false,
    },
    ProgramSpec {
        name: "sched_switch",
        kind: ProgramKind::TracePoint("sched", "sched_switch"),
        optional: false,
    },
    ProgramSpec {
        name: "oom_mark_victim",
        kind: ProgramKind::TracePoint("oom", "mark_victim"),
        optional: false,
    },
    ProgramSpec {
        name: "handle_mm_fault",
        kind: ProgramKind::KProbe("handle_mm_fault"),
        optional: false,
    },
    ProgramSpec {
        name: "tcp_sendmsg",
        kind: ProgramKind::KProbe("tcp_sendmsg"),
        optional: false,
    },
    ProgramSpec {
        name: "tcp_recvmsg",
        kind: ProgramKind::KProbe("tcp_recvmsg"),
        optional: false,
    },
    ProgramSpec {
        name: "tcp_retransmit_skb",
        kind: ProgramKind::TracePoint("tcp", "tcp_retransmit_skb"),
        optional: false,
    },
    ProgramSpec {
        name: "inet_sock_set_state",
        kind: ProgramKind::TracePoint("sock", "inet_sock_set_state"),
        optional: false,
    },
    ProgramSpec {
        name: "tcp_probe",
        kind: ProgramKind::TracePoint("tcp", "tcp_probe"),
        optional: true,
    },
    ProgramSpec {
        name: "sys_enter",
        kind: ProgramKind::RawTracePoint("sys_enter"),
        optional: false,
    },
    ProgramSpec {
        name: "sys_exit",
        kind: ProgramKind::RawTracePoint("sys_exit"),
        optional: false,
    },
];

/// Per-cgroup view assembled by merging every aggregation map's entries for
/// a given `cgroup_id` during a drain pass.
#[derive(Debug, Clone)]
pub struct CgroupSnapshot {
    pub cgroup_id: u64,
    pub runq_latency: Option<HistogramValue>,
    pub ctx_switches: Option<CounterValue>,
    pub oom_kills: Option<CounterValue>,
    pub major_faults: Option<CounterValue>,
    pub tcp_stats: Option<TcpStats>,
    pub rtt_hist: Option<HistogramValue>,
    pub conn_latency: Option<HistogramValue>,
}

impl CgroupSnapshot {
    fn new(cgroup_id: u64) -> Self {
        Self {
            cgroup_id,
            runq_latency: None,
            ctx_switches: None,
            oom_kills: None,
            major_faults: None,
            tcp_stats: None,
            rtt_hist: None,
            conn_latency: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SidecarCounts {
    pub entries: u64,
    pub update_errors: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub cgroups: Vec<CgroupSnapshot>,
    pub syscalls: Vec<(SyscallKey, SyscallStats)>,
    pub sidecars: StdHashMap<String, SidecarCounts>,
}

struct MapCatalog {
    wakeup_ts: AyaHashMap<MapData, u32, u64>,
    runq_latency: AyaHashMap<MapData, CgroupKey, HistogramValue>,
    ctx_switches: AyaHashMap<MapData, CgroupKey, CounterValue>,
    oom_kills: AyaHashMap<MapData, CgroupKey, CounterValue>,
    major_faults: AyaHashMap<MapData, CgroupKey, CounterValue>,
    tcp_stats_map: LruHashMap<MapData, CgroupKey, TcpStats>,
    rtt_hist: LruHashMap<MapData, CgroupKey, HistogramValue>,
    conn_start: AyaHashMap<MapData, u64, u64>,
    conn_latency: LruHashMap<MapData, CgroupKey, HistogramValue>,
    syscall_start: AyaHashMap<MapData, u64, u64>,
    syscall_nr_map: AyaHashMap<MapData, u64, u32>,
    syscall_stats_map: LruHashMap<MapData, SyscallKey, SyscallStats>,
    tracked_syscalls: AyaHashMap<MapData, u32, u8>,

    runq_latency_stats: PerCpuArray<MapData, u64>,
    ctx_switches_stats: PerCpuArray<MapData, u64>,
    oom_kills_stats: PerCpuArray<MapData, u64>,
    major_faults_stats: PerCpuArray<MapData, u64>,
    tcp_stats_map_stats: PerCpuArray<MapData, u64>,
    rtt_hist_stats: PerCpuArray<MapData, u64>,
    conn_latency_stats: PerCpuArray<MapData, u64>,
    syscall_stats_map_stats: PerCpuArray<MapData, u64>,
}

fn take_hash<K: aya::Pod, V: aya::Pod>(
    bpf: &mut Ebpf,
    name: &str,
) -> Result<AyaHashMap<MapData, K, V>, MapError> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| MapError::NotFound { name: name.to_string() })?;
    AyaHashMap::try_from(map).map_err(|source| MapError::Convert { name: name.to_string(), source })
}

fn take_lru<K: aya::Pod, V: aya::Pod>(
    bpf: &mut Ebpf,
    name: &str,
) -> Result<LruHashMap<MapData, K, V>, MapError> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| MapError::NotFound { name: name.to_string() })?;
    LruHashMap::try_from(map).map_err(|source| MapError::Convert { name: name.to_string(), source })
}

fn take_percpu_array(bpf: &mut Ebpf, name: &str) -> Result<PerCpuArray<MapData, u64>, MapError> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| MapError::NotFound { name: name.to_string() })?;
    PerCpuArray::try_from(map).map_err(|source| MapError::Convert { name: name.to_string(), source })
}

impl MapCatalog {
    fn open(bpf: &mut Ebpf) -> Result<Self, MapError> {
        Ok(Self {
            wakeup_ts: take_hash(bpf, map_names::WAKEUP_TS)?,
            runq_latency: take_hash(bpf, map_names::RUNQ_LATENCY)?,
            ctx_switches: take_hash(bpf, map_names::CTX_SWITCHES)?,
            oom_kills: take_hash(bpf, map_names::OOM_KILLS)?,
            major_faults: take_hash(bpf, map_names::MAJOR_FAULTS)?,
            tcp_stats_map: take_lru(bpf, map_names::TCP_STATS_MAP)?,
            rtt_hist: take_lru(bpf, map_names::RTT_HIST)?,
            conn_start: take_hash(bpf, map_names::CONN_START)?,
            conn_latency: take_lru(bpf, map_names::CONN_LATENCY)?,
            syscall_start: take_hash(bpf, map_names::SYSCALL_START)?,
            syscall_nr_map: take_hash(bpf, map_names::SYSCALL_NR_MAP)?,
            syscall_stats_map: take_lru(bpf, map_names::SYSCALL_STATS_MAP)?,
            tracked_syscalls: take_hash(bpf, map_names::TRACKED_SYSCALLS)?,

            runq_latency_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::RUNQ_LATENCY).as_str(),
            )?,
            ctx_switches_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::CTX_SWITCHES).as_str(),
            )?,
            oom_kills_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::OOM_KILLS).as_str(),
            )?,
            major_faults_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::MAJOR_FAULTS).as_str(),
            )?,
            tcp_stats_map_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::TCP_STATS_MAP).as_str(),
            )?,
            rtt_hist_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::RTT_HIST).as_str(),
            )?,
            conn_latency_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::CONN_LATENCY).as_str(),
            )?,
            syscall_stats_map_stats: take_percpu_array(
                bpf,
                map_names::sidecar_name(map_names::SYSCALL_STATS_MAP).as_str(),
            )?,
        })
    }

    fn read_sidecar(&self, map_name: &str) -> Result<SidecarCounts, MapError> {
        let array = match map_name {
            map_names::RUNQ_LATENCY => &self.runq_latency_stats,
            map_names::CTX_SWITCHES => &self.ctx_switches_stats,
            map_names::OOM_KILLS => &self.oom_kills_stats,
            map_names::MAJOR_FAULTS => &self.major_faults_stats,
            map_names::TCP_STATS_MAP => &self.tcp_stats_map_stats,
            map_names::RTT_HIST => &self.rtt_hist_stats,
            map_names::CONN_LATENCY => &self.conn_latency_stats,
            map_names::SYSCALL_STATS_MAP => &self.syscall_stats_map_stats,
            other => {
                return Err(MapError::NotFound { name: other.to_string() });
            }
        };
        let entries = array
            .get(&map_stat::ENTRIES, 0)
            .map_err(MapError::from)?
            .iter()
            .sum();
        let update_errors = array
            .get(&map_stat::UPDATE_ERRORS, 0)
            .map_err(MapError::from)?
            .iter()
            .sum();
        Ok(SidecarCounts { entries, update_errors })
    }
}

/// Drains a plain-hash map: collects its keys, then looks up and deletes
/// each one in `batch_size`-sized chunks. There is no native
/// lookup-and-delete-batch syscall bound in the pinned Aya revision, so this
/// preserves the O(n/batch) *accounting* (one log line per chunk) without
/// claiming to be the literal batched ioctl — see DESIGN.md.
fn drain_hash_map<K: aya::Pod, V: aya::Pod>(
    map: &mut AyaHashMap<MapData, K, V>,
    batch_size: usize,
) -> Result<Vec<(K, V)>, MapError> {
    let keys: Vec<K> = map.keys().collect::<Result<_, _>>()?;
    let mut drained = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(batch_size.max(1)) {
        for key in chunk {
            if let Ok(value) = map.get(key, 0) {
                drained.push((*key, value));
                let _ = map.remove(key);
            }
        }
        debug!("drained chunk of {} entries", chunk.len());
    }
    Ok(drained)
}

fn drain_lru_map<K: aya::Pod, V: aya::Pod>(
    map: &mut LruHashMap<MapData, K, V>,
    batch_size: usize,
) -> Result<Vec<(K, V)>, MapError> {
    let keys: Vec<K> = map.keys().collect::<Result<_, _>>()?;
    let mut drained = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(batch_size.max(1)) {
        for key in chunk {
            if let Ok(value) = map.get(key, 0) {
                drained.push((*key, value));
                let _ = map.remove(key);
            }
        }
        debug!("drained chunk of {} entries", chunk.len());
    }
    Ok(drained)
}

/// Opaque handle over a loaded probe object, enforcing
/// `Opened -> Loaded -> Attached -> (map ops) -> Destroyed`.
pub struct ProbeHandle {
    state: HandleState,
    object_path: PathBuf,
    object_bytes: Option<Vec<u8>>,
    bpf: Option<Ebpf>,
    maps: Option<MapCatalog>,
    attached_count: usize,
}

impl ProbeHandle {
    /// Opens a compiled probe object from a filesystem path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path).map_err(|source| LoadError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            state: HandleState::Opened,
            object_path: path,
            object_bytes: Some(bytes),
            bpf: None,
            maps: None,
            attached_count: 0,
        })
    }

    fn require(&self, expected: HandleState, op: &'static str) -> Result<(), LoadError> {
        if self.state != expected {
            return Err(LoadError::InvalidTransition {
                state: self.state.label(),
                op,
            });
        }
        Ok(())
    }

    /// Verifies and installs maps/programs into the kernel.
    pub fn load(&mut self) -> Result<(), LoadError> {
        self.require(HandleState::Opened, "load")?;
        let bytes = self
            .object_bytes
            .take()
            .expect("an opened handle always carries its object bytes");
        let mut bpf = EbpfLoader::new()
            .load(&bytes)
            .map_err(|source| LoadError::Load {
                path: self.object_path.clone(),
                source,
            })?;
        match aya_log::EbpfLogger::init(&mut bpf) {
            Ok(_logger) => info!("[cgtel-loader] BPF logger initialized"),
            Err(err) => warn!("[cgtel-loader] BPF logger not active: {err}"),
        }
        let maps = MapCatalog::open(&mut bpf).map_err(|source| LoadError::Attach {
            name: "map_catalog",
            source: Box::new(source),
        })?;
        self.bpf = Some(bpf);
        self.maps = Some(maps);
        self.state = HandleState::Loaded;
        Ok(())
    }

    /// Writes the tracked-syscall allowlist. Must run after `load` (the map
    /// must exist) and before `attach_all` (§4.6: the allowlist is populated
    /// by userspace before probes attach).
    pub fn populate_tracked_syscalls(&mut self, syscall_numbers: &[u32]) -> Result<(), MapError> {
        let maps = self.maps.as_mut().ok_or_else(|| MapError::NotFound {
            name: map_names::TRACKED_SYSCALLS.to_string(),
        })?;
        for &nr in syscall_numbers {
            maps.tracked_syscalls.insert(nr, 1u8, 0)?;
        }
        Ok(())
    }

    /// Iterates all programs in the object and attaches each one, tracking
    /// a running count for the `MAX_ATTACH_PROGRAMS` cap. Probes marked
    /// optional are attached best-effort, and skipped entirely when
    /// `enable_optional_probes` is `false`; a failure to attach one that was
    /// attempted is logged and skipped rather than propagated.
    pub fn attach_all(&mut self, enable_optional_probes: bool) -> Result<(), LoadError> {
        self.require(HandleState::Loaded, "attach_all")?;
        if PROGRAMS.len() > MAX_ATTACH_PROGRAMS {
            return Err(LoadError::TooManyPrograms {
                count: PROGRAMS.len(),
                cap: MAX_ATTACH_PROGRAMS,
            });
        }
        let bpf = self
            .bpf
            .as_mut()
            .expect("a loaded handle always carries a bpf object");

        for spec in PROGRAMS {
            if spec.optional && !enable_optional_probes {
                info!("[cgtel-loader] optional program {} skipped by config", spec.name);
                continue;
            }
            let result = attach_one(bpf, spec);
            match result {
                Ok(()) => {
                    self.attached_count += 1;
                    info!("[cgtel-loader] attached {}", spec.name);
                }
                Err(err) if spec.optional => {
                    warn!(
                        "[cgtel-loader] optional program {} not attached: {err}",
                        spec.name
                    );
                }
                Err(err) => return Err(err),
            }
        }

        self.state = HandleState::Attached;
        Ok(())
    }

    /// Drains every aggregation map, deleting consumed entries, and returns
    /// the merged per-cgroup and per-syscall view.
    pub fn drain_all(&mut self, batch_size: usize) -> Result<Snapshot, MapError> {
        let maps = self.maps.as_mut().ok_or_else(|| MapError::NotFound {
            name: "map_catalog".to_string(),
        })?;

        let mut by_cgroup: StdHashMap<u64, CgroupSnapshot> = StdHashMap::new();
        macro_rules! fold_hash {
            ($map:expr, $field:ident) => {
                for (key, value) in drain_hash_map(&mut $map, batch_size)? {
                    by_cgroup
                        .entry(key.cgroup_id)
                        .or_insert_with(|| CgroupSnapshot::new(key.cgroup_id))
                        .$field = Some(value);
                }
            };
        }
        macro_rules! fold_lru {
            ($map:expr, $field:ident) => {
                for (key, value) in drain_lru_map(&mut $map, batch_size)? {
                    by_cgroup
                        .entry(key.cgroup_id)
                        .or_insert_with(|| CgroupSnapshot::new(key.cgroup_id))
                        .$field = Some(value);
                }
            };
        }

        fold_hash!(maps.runq_latency, runq_latency);
        fold_hash!(maps.ctx_switches, ctx_switches);
        fold_hash!(maps.oom_kills, oom_kills);
        fold_hash!(maps.major_faults, major_faults);
        fold_lru!(maps.tcp_stats_map, tcp_stats);
        fold_lru!(maps.rtt_hist, rtt_hist);
        fold_lru!(maps.conn_latency, conn_latency);

        let syscalls = drain_lru_map(&mut maps.syscall_stats_map, batch_size)?;

        let mut sidecars = StdHashMap::new();
        for name in map_names::AGGREGATION_MAPS {
            let counts = maps.read_sidecar(name)?;
            sidecars.insert(map_names::sidecar_name(name).as_str().to_string(), counts);
        }

        Ok(Snapshot {
            cgroups: by_cgroup.into_values().collect(),
            syscalls,
            sidecars,
        })
    }

    /// Number of CPUs the per-CPU sidecar arrays carry one slot for.
    pub fn num_possible_cpus() -> Result<usize, MapError> {
        aya::util::online_cpus()
            .map(|cpus| cpus.len())
            .map_err(|(_, source)| MapError::Io(source))
    }

    /// Detaches all links and closes the object. Aya's `Ebpf` drop impl
    /// performs the detach-then-unload sequence internally; dropping it here
    /// rather than relying on `ProbeHandle`'s own drop keeps the explicit
    /// state transition visible to callers.
    pub fn destroy(mut self) {
        self.maps = None;
        self.bpf = None;
        self.state = HandleState::Destroyed;
        debug!(
            "[cgtel-loader] destroyed handle ({} programs were attached)",
            self.attached_count
        );
    }
}

fn attach_one(bpf: &mut Ebpf, spec: &ProgramSpec) -> Result<(), LoadError> {
    match spec.kind {
        ProgramKind::KProbe(symbol) => {
            let probe: &mut KProbe = bpf
                .program_mut(spec.name)
                .ok_or(LoadError::ProgramNotFound { name: spec.name })?
                .try_into()
                .map_err(|source| LoadError::ProgramKind { name: spec.name, source })?;
            probe
                .load()
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
            probe
                .attach(symbol, 0)
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
        }
        ProgramKind::TracePoint(category, name) => {
            let tp: &mut TracePoint = bpf
                .program_mut(spec.name)
                .ok_or(LoadError::ProgramNotFound { name: spec.name })?
                .try_into()
                .map_err(|source| LoadError::ProgramKind { name: spec.name, source })?;
            tp.load()
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
            tp.attach(category, name)
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
        }
        ProgramKind::RawTracePoint(name) => {
            let rtp: &mut RawTracePoint = bpf
                .program_mut(spec.name)
                .ok_or(LoadError::ProgramNotFound { name: spec.name })?
                .try_into()
                .map_err(|source| LoadError::ProgramKind { name: spec.name, source })?;
            rtp.load()
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
            rtp.attach(name)
                .map_err(|source| LoadError::Attach { name: spec.name, source: Box::new(source) })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_table_fits_the_attach_cap() {
        assert!(PROGRAMS.len() <= MAX_ATTACH_PROGRAMS);
    }

    #[test]
    fn program_names_are_unique() {
        let mut names: Vec<&str> = PROGRAMS.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PROGRAMS.len());
    }

    #[test]
    fn open_rejects_a_missing_path() {
        let err = ProbeHandle::open("/nonexistent/cgtel-ebpf-probes").unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }));
    }

    #[test]
    fn state_label_is_human_readable() {
        assert_eq!(HandleState::Opened.label(), "opened");
        assert_eq!(HandleState::Destroyed.label(), "destroyed");
    }

    /// `attach_all` requires a `Loaded` handle; calling it right after `open`
    /// (no real object bytes needed — `require()` rejects the state before
    /// touching `self.bpf`) must surface `InvalidTransition`, not panic on
    /// the handle's empty `bpf`/`maps` fields.
    #[test]
    fn attach_all_on_an_opened_handle_is_an_invalid_transition() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not a real bpf object").unwrap();
        let mut handle = ProbeHandle::open(file.path()).unwrap();
        assert_eq!(handle.state, HandleState::Opened);

        let err = handle.attach_all(true).unwrap_err();
        assert!(matches!(
            err,
            LoadError::InvalidTransition { state: "opened", op: "attach_all" }
        ));
    }

    /// Same invariant on `populate_tracked_syscalls`/`drain_all`, which key
    /// off `self.maps` being `None` rather than the state machine directly —
    /// both must fail cleanly (`MapError::NotFound`) rather than panic when
    /// called before `load`.
    #[test]
    fn map_ops_on_an_opened_handle_fail_cleanly_without_maps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not a real bpf object").unwrap();
        let mut handle = ProbeHandle::open(file.path()).unwrap();

        assert!(matches!(
            handle.populate_tracked_syscalls(&[0]).unwrap_err(),
            MapError::NotFound { .. }
        ));
        assert!(matches!(
            handle.drain_all(16).unwrap_err(),
            MapError::NotFound { .. }
        ));
    }
}
