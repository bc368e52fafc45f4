use aya_ebpf::{
    helpers::{bpf_get_current_cgroup_id, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{kprobe, map, raw_tracepoint, tracepoint},
    maps::{HashMap, LruHashMap, PerCpuArray},
    programs::{ProbeContext, RawTracePointContext, TracePointContext},
};
use cgtel_common::{
    map_stat, tcp_state, CgroupKey, CounterValue, HistogramValue, SyscallKey, SyscallStats,
    TcpStats, MAX_ENTRIES, MAX_TRACKED_SYSCALLS, PAGE_FAULT_WRITE_FLAG,
};

// =============================================================================
// C2 — shared map catalog
// =============================================================================
//
// Correlation tables: short-lived, overwrite-on-collision (BPF_ANY), no
// sidecar. Aggregation tables: fail-if-exists (BPF_NOEXIST) lookup-or-insert,
// each with a `<name>_stats` sidecar (see `sidecar!` below).

#[map(name = "wakeup_ts")]
static mut WAKEUP_TS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "runq_latency")]
static mut RUNQ_LATENCY: HashMap<CgroupKey, HistogramValue> =
    HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "ctx_switches")]
static mut CTX_SWITCHES: HashMap<CgroupKey, CounterValue> =
    HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "oom_kills")]
static mut OOM_KILLS: HashMap<CgroupKey, CounterValue> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "major_faults")]
static mut MAJOR_FAULTS: HashMap<CgroupKey, CounterValue> =
    HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "tcp_stats_map")]
static mut TCP_STATS_MAP: LruHashMap<CgroupKey, TcpStats> =
    LruHashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "rtt_hist")]
static mut RTT_HIST: LruHashMap<CgroupKey, HistogramValue> =
    LruHashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "conn_start")]
static mut CONN_START: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "conn_latency")]
static mut CONN_LATENCY: LruHashMap<CgroupKey, HistogramValue> =
    LruHashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "syscall_start")]
static mut SYSCALL_START: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "syscall_nr_map")]
static mut SYSCALL_NR_MAP: HashMap<u64, u32> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "syscall_stats_map")]
static mut SYSCALL_STATS_MAP: LruHashMap<SyscallKey, SyscallStats> =
    LruHashMap::with_max_entries(MAX_ENTRIES, 0);

#[map(name = "tracked_syscalls")]
static mut TRACKED_SYSCALLS: HashMap<u32, u8> =
    HashMap::with_max_entries(MAX_TRACKED_SYSCALLS, 0);

// =============================================================================
// C7 — map-stats sidecar
// =============================================================================
//
// One two-element per-CPU counter array per aggregation map, bumped on every
// lookup-or-insert outcome (ENTRIES on a successful insert, UPDATE_ERRORS on
// a failed one — a lost race against another CPU, or a full plain-hash map).

#[map(name = "runq_latency_stats")]
static mut RUNQ_LATENCY_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "ctx_switches_stats")]
static mut CTX_SWITCHES_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "oom_kills_stats")]
static mut OOM_KILLS_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "major_faults_stats")]
static mut MAJOR_FAULTS_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "tcp_stats_map_stats")]
static mut TCP_STATS_MAP_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "rtt_hist_stats")]
static mut RTT_HIST_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "conn_latency_stats")]
static mut CONN_LATENCY_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

#[map(name = "syscall_stats_map_stats")]
static mut SYSCALL_STATS_MAP_STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(map_stat::MAP_STAT_MAX, 0);

/// Bumps one slot of a sidecar array for the current CPU.
#[inline(always)]
fn stats_inc(sidecar: &PerCpuArray<u64>, index: u32) {
    if let Some(ptr) = sidecar.get_ptr_mut(index) {
        unsafe { *ptr += 1 };
    }
}

// =============================================================================
// C1 — bucketing / lookup-or-insert primitives
// =============================================================================
//
// `slot()` itself lives in `cgtel_common` so the same arithmetic runs on both
// sides of the kernel/userspace boundary. The atomic add used on the hit path
// below operates on raw map-value pointers since the entry is shared across
// CPUs; the miss path builds its initial value on the stack via the value
// types' plain `record()` methods before the fail-if-exists insert.

#[inline(always)]
unsafe fn atomic_add_u64(ptr: *mut u64, val: u64) {
    core::intrinsics::atomic_xadd_relaxed(ptr, val);
}

/// Fail-if-exists insert flag. Used on every aggregation-map miss-path
/// insert so a losing CPU in a cross-CPU race bumps `UPDATE_ERRORS` instead
/// of clobbering the winning CPU's freshly-inserted value.
const BPF_NOEXIST: u64 = 1;

/// Applies one histogram sample to `map[key]`, inserting a fresh entry on
/// miss and bumping `sidecar` accordingly.
fn histogram_bump(
    map: &HashMap<CgroupKey, HistogramValue>,
    sidecar: &PerCpuArray<u64>,
    key: CgroupKey,
    value_ns: u64,
) {
    if let Some(ptr) = map.get_ptr_mut(&key) {
        let hist = unsafe { &mut *ptr };
        let s = cgtel_common::slot(value_ns) as usize;
        unsafe {
            atomic_add_u64(&mut hist.slots[s] as *mut u64, 1);
            atomic_add_u64(&mut hist.count as *mut u64, 1);
            atomic_add_u64(&mut hist.sum_ns as *mut u64, value_ns);
        }
    } else {
        let mut fresh = HistogramValue::zeroed();
        fresh.record(value_ns);
        match map.insert(&key, &fresh, BPF_NOEXIST) {
            Ok(()) => stats_inc(sidecar, map_stat::ENTRIES),
            Err(_) => stats_inc(sidecar, map_stat::UPDATE_ERRORS),
        }
    }
}

fn lru_histogram_bump(
    map: &LruHashMap<CgroupKey, HistogramValue>,
    sidecar: &PerCpuArray<u64>,
    key: CgroupKey,
    value_ns: u64,
) {
    if let Some(ptr) = map.get_ptr_mut(&key) {
        let hist = unsafe { &mut *ptr };
        let s = cgtel_common::slot(value_ns) as usize;
        unsafe {
            atomic_add_u64(&mut hist.slots[s] as *mut u64, 1);
            atomic_add_u64(&mut hist.count as *mut u64, 1);
            atomic_add_u64(&mut hist.sum_ns as *mut u64, value_ns);
        }
    } else {
        let mut fresh = HistogramValue::zeroed();
        fresh.record(value_ns);
        match map.insert(&key, &fresh, BPF_NOEXIST) {
            Ok(()) => stats_inc(sidecar, map_stat::ENTRIES),
            Err(_) => stats_inc(sidecar, map_stat::UPDATE_ERRORS),
        }
    }
}

/// Applies one increment to `map[key]`, inserting a fresh entry on miss and
/// bumping `sidecar` accordingly.
fn counter_bump(
    map: &HashMap<CgroupKey, CounterValue>,
    sidecar: &PerCpuArray<u64>,
    key: CgroupKey,
) {
    if let Some(ptr) = map.get_ptr_mut(&key) {
        unsafe { atomic_add_u64(&mut (*ptr).count as *mut u64, 1) };
    } else {
        let mut fresh = CounterValue::zeroed();
        fresh.record();
        match map.insert(&key, &fresh, BPF_NOEXIST) {
            Ok(()) => stats_inc(sidecar, map_stat::ENTRIES),
            Err(_) => stats_inc(sidecar, map_stat::UPDATE_ERRORS),
        }
    }
}

// =============================================================================
// C3 — scheduler probe
// =============================================================================
//
// Known limitation (matches the original implementation): `sched_switch`
// fires with the OUTGOING task's cgroup current. That's correct for
// `ctx_switches`, but `runq_latency` ends up attributed to whichever cgroup
// was running right before the woken task, not the woken task's own cgroup.
// Left as-is rather than walking task_struct for the real owner.

const SCHED_WAKEUP_PID_OFFSET: usize = 24;
const SCHED_SWITCH_NEXT_PID_OFFSET: usize = 56;

fn tp_read_u32(ctx: &TracePointContext, offset: usize) -> Option<u32> {
    unsafe { ctx.read_at::<u32>(offset).ok() }
}

#[tracepoint(category = "sched", name = "sched_wakeup")]
pub fn sched_wakeup(ctx: TracePointContext) -> u32 {
    try_sched_wakeup(ctx).unwrap_or(0)
}

fn try_sched_wakeup(ctx: TracePointContext) -> Option<u32> {
    let pid = tp_read_u32(&ctx, SCHED_WAKEUP_PID_OFFSET)?;
    let now = unsafe { bpf_ktime_get_ns() };
    let map = unsafe { &WAKEUP_TS };
    let _ = map.insert(&pid, &now, 0);
    Some(0)
}

#[tracepoint(category = "sched", name = "sched_switch")]
pub fn sched_switch(ctx: TracePointContext) -> u32 {
    try_sched_switch(ctx).unwrap_or(0)
}

fn try_sched_switch(ctx: TracePointContext) -> Option<u32> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    let key = CgroupKey { cgroup_id };
    counter_bump(
        unsafe { &CTX_SWITCHES },
        unsafe { &CTX_SWITCHES_STATS },
        key,
    );

    let next_pid = tp_read_u32(&ctx, SCHED_SWITCH_NEXT_PID_OFFSET)?;
    let wakeup_map = unsafe { &WAKEUP_TS };
    let wakeup_ts = unsafe { wakeup_map.get(&next_pid).copied() }?;
    let now = unsafe { bpf_ktime_get_ns() };
    let delta_ns = now.saturating_sub(wakeup_ts);
    let _ = wakeup_map.remove(&next_pid);

    histogram_bump(
        unsafe { &RUNQ_LATENCY },
        unsafe { &RUNQ_LATENCY_STATS },
        key,
        delta_ns,
    );
    Some(0)
}

// =============================================================================
// C4 — memory probe
// =============================================================================

#[tracepoint(category = "oom", name = "mark_victim")]
pub fn oom_mark_victim(_ctx: TracePointContext) -> u32 {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    counter_bump(
        unsafe { &OOM_KILLS },
        unsafe { &OOM_KILLS_STATS },
        CgroupKey { cgroup_id },
    );
    0
}

#[kprobe(function = "handle_mm_fault")]
pub fn handle_mm_fault(ctx: ProbeContext) -> u32 {
    try_handle_mm_fault(ctx).unwrap_or(0)
}

fn try_handle_mm_fault(ctx: ProbeContext) -> Option<u32> {
    // handle_mm_fault(struct vm_area_struct *vma, unsigned long address, unsigned int flags, ...)
    let flags: u64 = ctx.arg(2)?;
    if flags & PAGE_FAULT_WRITE_FLAG == 0 {
        return Some(0);
    }
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    counter_bump(
        unsafe { &MAJOR_FAULTS },
        unsafe { &MAJOR_FAULTS_STATS },
        CgroupKey { cgroup_id },
    );
    Some(0)
}

// =============================================================================
// C5 — network probe
// =============================================================================

#[kprobe(function = "tcp_sendmsg")]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    try_tcp_sendmsg(ctx).unwrap_or(0)
}

fn try_tcp_sendmsg(ctx: ProbeContext) -> Option<u32> {
    // tcp_sendmsg(struct sock *sk, struct msghdr *msg, size_t size)
    let size: u64 = ctx.arg(2)?;
    tcp_stats_bump(|s| s.bytes_sent += size);
    Some(0)
}

#[kprobe(function = "tcp_recvmsg")]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    try_tcp_recvmsg(ctx).unwrap_or(0)
}

fn try_tcp_recvmsg(ctx: ProbeContext) -> Option<u32> {
    // Upper-bound approximation: `len` is the caller's buffer size, not the
    // number of bytes actually copied out. A kretprobe would be required for
    // an exact count and is out of scope (matches the original implementation).
    let len: u64 = ctx.arg(2)?;
    tcp_stats_bump(|s| s.bytes_received += len);
    Some(0)
}

#[tracepoint(category = "tcp", name = "tcp_retransmit_skb")]
pub fn tcp_retransmit_skb(_ctx: TracePointContext) -> u32 {
    tcp_stats_bump(|s| s.retransmits += 1);
    0
}

const INET_SOCK_SET_STATE_NEWSTATE_OFFSET: usize = 20;

#[tracepoint(category = "sock", name = "inet_sock_set_state")]
pub fn inet_sock_set_state(ctx: TracePointContext) -> u32 {
    try_inet_sock_set_state(ctx).unwrap_or(0)
}

fn try_inet_sock_set_state(ctx: TracePointContext) -> Option<u32> {
    let newstate = tp_read_u32(&ctx, INET_SOCK_SET_STATE_NEWSTATE_OFFSET)? as i32;
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };

    if newstate == tcp_state::SYN_SENT {
        let now = unsafe { bpf_ktime_get_ns() };
        let map = unsafe { &CONN_START };
        let _ = map.insert(&pid_tgid, &now, 0);
        return Some(0);
    }

    if newstate == tcp_state::ESTABLISHED {
        tcp_stats_bump(|s| s.connections += 1);

        let conn_start = unsafe { &CONN_START };
        if let Some(start_ts) = unsafe { conn_start.get(&pid_tgid).copied() } {
            let now = unsafe { bpf_ktime_get_ns() };
            let delta_ns = now.saturating_sub(start_ts);
            let _ = conn_start.remove(&pid_tgid);
            let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
            lru_histogram_bump(
                unsafe { &CONN_LATENCY },
                unsafe { &CONN_LATENCY_STATS },
                CgroupKey { cgroup_id },
                delta_ns,
            );
        }
    }
    Some(0)
}

// trace_event_raw_tcp_probe layout is kernel-version sensitive; this offset
// targets the common 5.x layout (header + skaddr + sport/dport + v4/v6
// address arrays land `srtt` here on the kernels this was checked against).
const TCP_PROBE_SRTT_OFFSET: usize = 56;

#[tracepoint(category = "tcp", name = "tcp_probe")]
pub fn tcp_probe(ctx: TracePointContext) -> u32 {
    try_tcp_probe(ctx).unwrap_or(0)
}

fn try_tcp_probe(ctx: TracePointContext) -> Option<u32> {
    let srtt_us = tp_read_u32(&ctx, TCP_PROBE_SRTT_OFFSET)? as u64;
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    let key = CgroupKey { cgroup_id };

    // Only folds into tcp_stats_map if the entry already exists: unlike every
    // other aggregate here, there is no insert-on-miss branch for the rtt
    // fields in the original implementation, only for the histogram below.
    let stats_map = unsafe { &TCP_STATS_MAP };
    if let Some(ptr) = stats_map.get_ptr_mut(&key) {
        unsafe {
            atomic_add_u64(&mut (*ptr).rtt_sum_us as *mut u64, srtt_us);
            atomic_add_u64(&mut (*ptr).rtt_count as *mut u64, 1);
        }
    }

    let rtt_ns = srtt_us.saturating_mul(1000);
    lru_histogram_bump(
        unsafe { &RTT_HIST },
        unsafe { &RTT_HIST_STATS },
        key,
        rtt_ns,
    );
    Some(0)
}

fn tcp_stats_bump(apply: impl FnOnce(&mut TcpStats)) {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    let key = CgroupKey { cgroup_id };
    let map = unsafe { &TCP_STATS_MAP };
    if let Some(ptr) = map.get_ptr_mut(&key) {
        apply(unsafe { &mut *ptr });
    } else {
        let mut fresh = TcpStats::zeroed();
        apply(&mut fresh);
        match map.insert(&key, &fresh, BPF_NOEXIST) {
            Ok(()) => stats_inc(unsafe { &TCP_STATS_MAP_STATS }, map_stat::ENTRIES),
            Err(_) => stats_inc(unsafe { &TCP_STATS_MAP_STATS }, map_stat::UPDATE_ERRORS),
        }
    }
}

// =============================================================================
// C6 — syscall probe
// =============================================================================

#[raw_tracepoint(function = "sys_enter")]
pub fn sys_enter(ctx: RawTracePointContext) -> i32 {
    try_sys_enter(ctx).unwrap_or(0)
}

fn try_sys_enter(ctx: RawTracePointContext) -> Option<i32> {
    let syscall_nr: u32 = unsafe { ctx.arg(1) };
    let tracked = unsafe { &TRACKED_SYSCALLS };
    tracked.get(&syscall_nr)?;

    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let now = unsafe { bpf_ktime_get_ns() };
    let _ = unsafe { SYSCALL_START.insert(&pid_tgid, &now, 0) };
    let _ = unsafe { SYSCALL_NR_MAP.insert(&pid_tgid, &syscall_nr, 0) };
    Some(0)
}

#[raw_tracepoint(function = "sys_exit")]
pub fn sys_exit(ctx: RawTracePointContext) -> i32 {
    try_sys_exit(ctx).unwrap_or(0)
}

fn try_sys_exit(ctx: RawTracePointContext) -> Option<i32> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let ret: i64 = unsafe { ctx.arg(1) };

    let start_map = unsafe { &SYSCALL_START };
    let start_ts = match unsafe { start_map.get(&pid_tgid).copied() } {
        Some(ts) => ts,
        None => return Some(0),
    };

    let nr_map = unsafe { &SYSCALL_NR_MAP };
    let nr = match unsafe { nr_map.get(&pid_tgid).copied() } {
        Some(nr) => nr,
        None => {
            let _ = start_map.remove(&pid_tgid);
            return Some(0);
        }
    };

    let now = unsafe { bpf_ktime_get_ns() };
    let delta_ns = now.saturating_sub(start_ts);
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    let key = SyscallKey::new(cgroup_id, nr);

    let stats_map = unsafe { &SYSCALL_STATS_MAP };
    if let Some(ptr) = stats_map.get_ptr_mut(&key) {
        let stats = unsafe { &mut *ptr };
        let s = cgtel_common::slot(delta_ns) as usize;
        unsafe {
            atomic_add_u64(&mut stats.count as *mut u64, 1);
            if ret < 0 {
                atomic_add_u64(&mut stats.error_count as *mut u64, 1);
            }
            atomic_add_u64(&mut stats.latency_sum_ns as *mut u64, delta_ns);
            atomic_add_u64(&mut stats.latency_slots[s] as *mut u64, 1);
        }
    } else {
        let mut fresh = SyscallStats::zeroed();
        fresh.record(delta_ns, ret < 0);
        match stats_map.insert(&key, &fresh, BPF_NOEXIST) {
            Ok(()) => stats_inc(
                unsafe { &SYSCALL_STATS_MAP_STATS },
                map_stat::ENTRIES,
            ),
            Err(_) => stats_inc(
                unsafe { &SYSCALL_STATS_MAP_STATS },
                map_stat::UPDATE_ERRORS,
            ),
        }
    }

    let _ = start_map.remove(&pid_tgid);
    let _ = nr_map.remove(&pid_tgid);
    Some(0)
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
