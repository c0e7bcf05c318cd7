use std::{
    cmp::Reverse,
    collections::HashMap,
    io::{self, Write},
};

use serde::Serialize;

use crate::{
    config::TrackerConfig,
    merge::Merger,
    record::{CallerAggregate, RegionKind, StackAggregate, StackKey},
    stats::{Counters, Diagnostics},
    symbol::{ModuleInfo, Symbolizer},
};

const UNKNOWN_MODULE: &str = "<unknown>";
const RULE: &str = "---------------------------------------------------";

/// A complete dump: one snapshot rendered both as JSON and as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpReport {
    /// Heap allocations.
    pub heap: RegionReport,
    /// Mapped-memory allocations, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmap: Option<RegionReport>,
    /// Diagnostic totals taken together with the snapshot.
    pub diagnostics: Diagnostics,
}

/// Live allocations of one region kind, grouped by module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionReport {
    /// Region namespace.
    pub kind: RegionKind,
    /// Live records in this region.
    pub pointer_count: usize,
    /// Live bytes in this region.
    pub total_size: usize,
    /// Caller groups, largest first.
    pub callers: Vec<CallerGroup>,
    /// Stack groups, largest first.
    pub stacks: Vec<StackGroup>,
}

impl RegionReport {
    /// Sum of every caller group's total. Always equals `total_size`.
    pub fn caller_total(&self) -> usize {
        saturating_total(self.callers.iter().map(|group| group.total_size))
    }

    /// Sum of every stack group's total.
    pub fn stack_total(&self) -> usize {
        saturating_total(self.stacks.iter().map(|group| group.total_size))
    }
}

/// Call sites within one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerGroup {
    /// Module containing the call sites, `<unknown>` when unresolved.
    pub module: String,
    /// Live bytes attributed to this module.
    pub total_size: usize,
    /// Live records attributed to this module.
    pub pointer_count: usize,
    /// The largest call sites.
    pub top_callers: Vec<CallerEntry>,
    /// Call sites beyond `top_callers`.
    pub remaining: Remainder,
    /// Most common allocation sizes, by `size * count`.
    pub sizes: Vec<SizeBucket>,
}

/// One call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerEntry {
    /// Return address, relative to the module base when the module is known.
    pub offset: usize,
    /// Live bytes.
    pub total_size: usize,
    /// Live records.
    pub pointer_count: usize,
}

/// Live records of one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeBucket {
    /// Allocation size in bytes.
    pub size: usize,
    /// Live records of this size.
    pub count: usize,
}

/// Entries summarized instead of detailed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remainder {
    /// Number of entries.
    pub count: usize,
    /// Their combined live bytes.
    pub total_size: usize,
}

impl Remainder {
    fn add(&mut self, size: usize) {
        self.count += 1;
        self.total_size = self.total_size.saturating_add(size);
    }
}

/// Sampled stacks attributed to one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackGroup {
    /// Module of the stacks' call site.
    pub module: String,
    /// Live bytes across the group's stacks.
    pub total_size: usize,
    /// Whether per-stack detail was left out because the group is below the detail threshold.
    pub detail_omitted: bool,
    /// The largest stacks.
    pub top_stacks: Vec<StackEntry>,
    /// Stacks beyond `top_stacks`.
    pub remaining: Remainder,
}

/// One sampled stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    /// Live bytes allocated under this stack.
    pub size: usize,
    /// Brief encoding: `module;offset;offset;othermodule;offset;`, module names only when they change.
    pub stack: String,
    /// Symbolized frames, innermost first. Only rendered in the text dump.
    #[serde(skip)]
    pub frames: Vec<FrameLine>,
}

/// One symbolized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLine {
    /// Return address relative to its module.
    pub offset: usize,
    /// Function name, when resolvable.
    pub function: Option<String>,
    /// Module name, `<unknown>` when unresolved.
    pub module: String,
}

impl DumpReport {
    /// Writes the structured rendering.
    pub fn write_json<W: Write>(&self, out: W) -> Result<(), serde_json::Error> {
        serde_json::to_writer_pretty(out, self)
    }

    /// Writes the human-readable rendering.
    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, ">>> memory dump")?;
        write_region(out, &self.heap)?;
        if let Some(mmap) = &self.mmap {
            write_region(out, mmap)?;
        }

        let d = &self.diagnostics;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "live pointers = {}", d.live_pointers)?;
        writeln!(out, "live stacks = {}", d.live_stacks)?;
        writeln!(out, "lost pointers = {}", d.lost_pointers)?;
        writeln!(out, "invalid pointers = {}", d.invalid_pointers)?;
        writeln!(out, "stack captures = {}", d.stack_captures)?;
        writeln!(out, "unwind failures = {}", d.unwind_failures)?;
        writeln!(out, "stale evictions = {}", d.stale_evictions)?;
        writeln!(out, "dirty addresses = {}", d.dirty_addresses)?;
        writeln!(out, "outstanding frees = {}", d.outstanding_frees)?;
        writeln!(out, "stack mismatches = {}", d.stack_mismatches)?;
        writeln!(out, "<<< memory dump")
    }
}

/// Sums byte totals, saturating like the aggregates they come from.
fn saturating_total(sizes: impl Iterator<Item = usize>) -> usize {
    sizes.fold(0, usize::saturating_add)
}

fn write_region<W: Write>(out: &mut W, region: &RegionReport) -> io::Result<()> {
    writeln!(out, "########## {} ##########", region.kind)?;
    writeln!(
        out,
        "callers: modules = {}, pointers = {}",
        region.callers.len(),
        region.pointer_count
    )?;
    for group in &region.callers {
        writeln!(
            out,
            "caller alloc size = {:>10} b, pointers = {}, module = {}",
            group.total_size, group.pointer_count, group.module
        )?;
        for caller in &group.top_callers {
            writeln!(
                out,
                "   caller {:#x} : size = {:>10} b, pointers = {}",
                caller.offset, caller.total_size, caller.pointer_count
            )?;
        }
        if group.remaining.count > 0 {
            writeln!(
                out,
                "   ... {} more callers, {} b",
                group.remaining.count, group.remaining.total_size
            )?;
        }
        for bucket in &group.sizes {
            writeln!(out, "   size = {:>10} b x {}", bucket.size, bucket.count)?;
        }
    }
    writeln!(out, "{}", RULE)?;
    writeln!(out, "| caller total size = {} b", region.caller_total())?;
    writeln!(out, "{}", RULE)?;

    writeln!(out, "stacks: modules = {}", region.stacks.len())?;
    for group in &region.stacks {
        writeln!(
            out,
            "stack alloc size = {:>10} b, module = {}",
            group.total_size, group.module
        )?;
        if group.detail_omitted {
            writeln!(out, "   detail omitted below threshold")?;
        }
        for stack in &group.top_stacks {
            writeln!(out, "   stack size = {} b", stack.size)?;
            for frame in &stack.frames {
                writeln!(
                    out,
                    "      | #pc {:x} {} ({})",
                    frame.offset,
                    frame.function.as_deref().unwrap_or("??"),
                    frame.module
                )?;
            }
        }
        if group.remaining.count > 0 {
            writeln!(
                out,
                "   ... {} more stacks, {} b",
                group.remaining.count, group.remaining.total_size
            )?;
        }
    }
    writeln!(out, "{}", RULE)?;
    writeln!(out, "| stack total size = {} b", region.stack_total())
}

/// Owned data copied out of the shared bucket in one pass.
pub(crate) struct Collected {
    heap: RegionSnapshot,
    mmap: Option<RegionSnapshot>,
    pub live_pointers: usize,
    pub live_stacks: usize,
}

struct RegionSnapshot {
    kind: RegionKind,
    pointers: usize,
    total: usize,
    callers: HashMap<usize, CallerAggregate>,
    stacks: Vec<StackAggregate>,
}

impl RegionSnapshot {
    fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            pointers: 0,
            total: 0,
            callers: HashMap::new(),
            stacks: Vec::new(),
        }
    }
}

/// Walks the shared bucket once, building caller aggregates and recounting every stack aggregate.
///
/// The incrementally maintained stack totals are checked against the recount; a disagreement is counted and logged,
/// and the recount is what gets reported. The bucket lock is released before anything is symbolized.
pub(crate) fn collect(merger: &Merger, counters: &Counters, include_mmap: bool) -> Collected {
    let bucket = merger.bucket();

    let mut heap = RegionSnapshot::new(RegionKind::Heap);
    let mut mmap = include_mmap.then(|| RegionSnapshot::new(RegionKind::Mmap));
    let mut recount: HashMap<StackKey, usize> = HashMap::new();

    for record in bucket.records() {
        let region = match record.kind {
            RegionKind::Heap => &mut heap,
            RegionKind::Mmap => match mmap.as_mut() {
                Some(region) => region,
                None => continue,
            },
        };

        region.pointers += 1;
        region.total = region.total.saturating_add(record.size);
        region
            .callers
            .entry(record.caller)
            .or_insert_with(|| CallerAggregate::new(record.caller))
            .attach(record);

        if let Some(key) = record.stack_key() {
            let total = recount.entry(key).or_default();
            *total = total.saturating_add(record.size);
        }
    }

    for (key, aggregate) in bucket.stacks() {
        let region = match key.kind {
            RegionKind::Heap => &mut heap,
            RegionKind::Mmap => match mmap.as_mut() {
                Some(region) => region,
                None => continue,
            },
        };

        let counted = recount.remove(key).unwrap_or(0);
        if counted != aggregate.total {
            Counters::bump(&counters.stack_mismatches);
            tracing::warn!(
                hash = aggregate.hash.0,
                kept = aggregate.total,
                counted,
                "stack total disagrees with live records"
            );
        }

        if counted > 0 {
            let mut aggregate = aggregate.clone();
            aggregate.total = counted;
            region.stacks.push(aggregate);
        }
    }

    for (key, counted) in recount {
        if key.kind == RegionKind::Mmap && !include_mmap {
            continue;
        }
        Counters::bump(&counters.stack_mismatches);
        tracing::warn!(hash = key.hash.0, counted, "live records reference a missing stack");
    }

    Collected {
        heap,
        mmap,
        live_pointers: bucket.live_len(),
        live_stacks: bucket.stacks().len(),
    }
}

/// Groups, sorts, caps and symbolizes a collected snapshot.
pub(crate) fn build(
    collected: Collected,
    symbolizer: &dyn Symbolizer,
    config: &TrackerConfig,
    diagnostics: Diagnostics,
) -> DumpReport {
    let builder = ReportBuilder { symbolizer, config };
    DumpReport {
        heap: builder.region(collected.heap),
        mmap: collected.mmap.map(|region| builder.region(region)),
        diagnostics,
    }
}

struct ReportBuilder<'a> {
    symbolizer: &'a dyn Symbolizer,
    config: &'a TrackerConfig,
}

impl ReportBuilder<'_> {
    fn region(&self, snapshot: RegionSnapshot) -> RegionReport {
        RegionReport {
            kind: snapshot.kind,
            pointer_count: snapshot.pointers,
            total_size: snapshot.total,
            callers: self.caller_groups(snapshot.callers),
            stacks: self.stack_groups(snapshot.stacks),
        }
    }

    fn caller_groups(&self, callers: HashMap<usize, CallerAggregate>) -> Vec<CallerGroup> {
        let mut by_module: HashMap<String, Vec<(usize, CallerAggregate)>> = HashMap::new();
        for (caller, aggregate) in callers {
            let (module, offset) = match self.symbolizer.module_of(caller) {
                Some(module) => (module.name.to_string(), module.relative(caller)),
                None => (UNKNOWN_MODULE.to_string(), caller),
            };
            by_module.entry(module).or_default().push((offset, aggregate));
        }

        let mut groups = by_module
            .into_iter()
            .map(|(module, mut callers)| {
                callers.sort_by_key(|(offset, aggregate)| (Reverse(aggregate.total), *offset));

                let total_size = saturating_total(callers.iter().map(|(_, aggregate)| aggregate.total));
                let pointer_count = callers.iter().map(|(_, aggregate)| aggregate.addresses.len()).sum();

                let mut histogram: HashMap<usize, usize> = HashMap::new();
                for (_, aggregate) in &callers {
                    for (size, count) in &aggregate.sizes {
                        *histogram.entry(*size).or_default() += count;
                    }
                }
                let mut sizes = histogram
                    .into_iter()
                    .map(|(size, count)| SizeBucket { size, count })
                    .collect::<Vec<_>>();
                sizes.sort_by_key(|bucket| (Reverse(bucket.size.saturating_mul(bucket.count)), bucket.size));
                sizes.truncate(self.config.size_histogram_top);

                let mut remaining = Remainder::default();
                let top_callers = callers
                    .iter()
                    .enumerate()
                    .filter_map(|(rank, (offset, aggregate))| {
                        if rank < self.config.top_n {
                            Some(CallerEntry {
                                offset: *offset,
                                total_size: aggregate.total,
                                pointer_count: aggregate.addresses.len(),
                            })
                        } else {
                            remaining.add(aggregate.total);
                            None
                        }
                    })
                    .collect();

                CallerGroup {
                    module,
                    total_size,
                    pointer_count,
                    top_callers,
                    remaining,
                    sizes,
                }
            })
            .collect::<Vec<_>>();

        groups.sort_by(|a, b| b.total_size.cmp(&a.total_size).then_with(|| a.module.cmp(&b.module)));
        groups
    }

    fn stack_groups(&self, stacks: Vec<StackAggregate>) -> Vec<StackGroup> {
        let mut by_module: HashMap<String, Vec<StackAggregate>> = HashMap::new();
        for stack in stacks {
            let module = self
                .stack_module(&stack)
                .map_or_else(|| UNKNOWN_MODULE.to_string(), |module| module.name.to_string());
            by_module.entry(module).or_default().push(stack);
        }

        let mut groups = by_module
            .into_iter()
            .map(|(module, mut stacks)| {
                stacks.sort_by_key(|stack| (Reverse(stack.total), stack.hash));

                let total_size = saturating_total(stacks.iter().map(|stack| stack.total));
                let detail_omitted = total_size < self.config.stack_detail_threshold;
                let detailed = if detail_omitted { 0 } else { self.config.top_n };

                let mut remaining = Remainder::default();
                let mut top_stacks = Vec::new();
                for (rank, stack) in stacks.iter().enumerate() {
                    if rank < detailed {
                        top_stacks.push(self.stack_entry(stack));
                    } else {
                        remaining.add(stack.total);
                    }
                }

                StackGroup {
                    module,
                    total_size,
                    detail_omitted,
                    top_stacks,
                    remaining,
                }
            })
            .collect::<Vec<_>>();

        groups.sort_by(|a, b| b.total_size.cmp(&a.total_size).then_with(|| a.module.cmp(&b.module)));
        groups
    }

    /// The stack's call site module, falling back to the innermost frame with a known module.
    fn stack_module(&self, stack: &StackAggregate) -> Option<ModuleInfo> {
        self.symbolizer
            .module_of(stack.caller)
            .or_else(|| stack.frames.iter().find_map(|frame| self.symbolizer.module_of(*frame)))
    }

    fn stack_entry(&self, stack: &StackAggregate) -> StackEntry {
        let mut brief = String::new();
        let mut current: Option<String> = None;
        let mut frames = Vec::with_capacity(stack.frames.len());

        for address in stack.frames.iter().copied() {
            let (module, offset) = match self.symbolizer.module_of(address) {
                Some(module) => (module.name.to_string(), module.relative(address)),
                None => (UNKNOWN_MODULE.to_string(), address),
            };

            if current.as_deref() != Some(module.as_str()) {
                brief.push_str(&module);
                brief.push(';');
                current = Some(module.clone());
            }
            brief.push_str(&format!("{:x};", offset));

            frames.push(FrameLine {
                offset,
                function: self.symbolizer.function_name(address),
                module,
            });
        }

        StackEntry {
            size: stack.total,
            stack: brief,
            frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Puts addresses below 0x10000 in `liba.so` and the rest in `libb.so`.
    struct TwoModules;

    impl Symbolizer for TwoModules {
        fn module_of(&self, address: usize) -> Option<ModuleInfo> {
            match address {
                0 => None,
                0x1..=0xffff => Some(ModuleInfo::new("liba.so", 0)),
                _ => Some(ModuleInfo::new("libb.so", 0x10000)),
            }
        }

        fn function_name(&self, address: usize) -> Option<String> {
            (address == 0x20).then(|| "alloc_widget".to_string())
        }
    }

    fn caller(caller: usize, sizes: &[(usize, usize)]) -> (usize, CallerAggregate) {
        let mut aggregate = CallerAggregate::new(caller);
        let mut address = caller << 8;
        for (size, count) in sizes {
            for _ in 0..*count {
                address += 1;
                aggregate.addresses.insert(address);
                aggregate.total += size;
                *aggregate.sizes.entry(*size).or_default() += 1;
            }
        }
        (caller, aggregate)
    }

    fn stack(frames: &[usize], total: usize, caller: usize) -> StackAggregate {
        let frames: Arc<[usize]> = Arc::from(frames.to_vec());
        let mut aggregate = StackAggregate::new(crate::stack::hash_frames(&frames), frames, caller);
        aggregate.attach(total);
        aggregate
    }

    fn builder(config: &TrackerConfig) -> ReportBuilder<'_> {
        ReportBuilder {
            symbolizer: &TwoModules,
            config,
        }
    }

    #[test]
    fn caller_groups_sort_and_cap_per_module() {
        let config = TrackerConfig::builder().top_n(1).build();
        let callers = [
            caller(0x10, &[(100, 1)]),
            caller(0x20, &[(300, 1)]),
            caller(0x10010, &[(50, 2)]),
        ]
        .into_iter()
        .collect();

        let groups = builder(&config).caller_groups(callers);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].module, "liba.so");
        assert_eq!(groups[0].total_size, 400);
        assert_eq!(groups[0].top_callers.len(), 1);
        assert_eq!(groups[0].top_callers[0].offset, 0x20);
        assert_eq!(groups[0].remaining, Remainder { count: 1, total_size: 100 });

        assert_eq!(groups[1].module, "libb.so");
        assert_eq!(groups[1].top_callers[0].offset, 0x10);
        assert_eq!(groups[1].pointer_count, 2);
    }

    #[test]
    fn unresolved_callers_group_as_unknown() {
        let config = TrackerConfig::default();
        let groups = builder(&config).caller_groups([caller(0, &[(8, 3)])].into_iter().collect());
        assert_eq!(groups[0].module, UNKNOWN_MODULE);
        assert_eq!(groups[0].total_size, 24);
    }

    #[test]
    fn size_histogram_ranks_by_bytes() {
        let config = TrackerConfig::builder().size_histogram_top(2).build();
        let callers = [caller(0x10, &[(8, 10), (1024, 1)]), caller(0x20, &[(8, 5), (16, 1)])]
            .into_iter()
            .collect();

        let groups = builder(&config).caller_groups(callers);
        assert_eq!(
            groups[0].sizes,
            vec![SizeBucket { size: 1024, count: 1 }, SizeBucket { size: 8, count: 15 }]
        );
    }

    #[test]
    fn brief_stack_names_module_only_on_change() {
        let config = TrackerConfig::default();
        let stacks = vec![stack(&[0x20, 0x30, 0x10100, 0x40], 64, 0x20)];

        let groups = builder(&config).stack_groups(stacks);
        let entry = &groups[0].top_stacks[0];
        assert_eq!(entry.stack, "liba.so;20;30;libb.so;100;liba.so;40;");
        assert_eq!(entry.frames[0].function.as_deref(), Some("alloc_widget"));
        assert_eq!(entry.frames[2].module, "libb.so");
    }

    #[test]
    fn small_stack_groups_omit_detail() {
        let config = TrackerConfig::builder().stack_detail_threshold(1000).build();
        let stacks = vec![
            stack(&[0x20], 600, 0x20),
            stack(&[0x30], 500, 0x30),
            stack(&[0x10100], 10, 0x10100),
        ];

        let groups = builder(&config).stack_groups(stacks);
        assert_eq!(groups[0].module, "liba.so");
        assert!(!groups[0].detail_omitted);
        assert_eq!(groups[0].top_stacks.len(), 2);

        assert!(groups[1].detail_omitted);
        assert!(groups[1].top_stacks.is_empty());
        assert_eq!(groups[1].remaining, Remainder { count: 1, total_size: 10 });
    }

    #[test]
    fn stack_module_falls_back_to_frames() {
        let config = TrackerConfig::default();
        let groups = builder(&config).stack_groups(vec![stack(&[0x10100], 8, 0)]);
        assert_eq!(groups[0].module, "libb.so");
        assert_eq!(groups[0].top_stacks[0].stack, "libb.so;100;");
    }

    #[test]
    fn text_and_json_render_the_same_totals() {
        let config = TrackerConfig::default();
        let builder = builder(&config);
        let region = RegionReport {
            kind: RegionKind::Heap,
            pointer_count: 2,
            total_size: 400,
            callers: builder.caller_groups(
                [caller(0x10, &[(100, 1)]), caller(0x20, &[(300, 1)])]
                    .into_iter()
                    .collect(),
            ),
            stacks: builder.stack_groups(vec![stack(&[0x20], 300, 0x20)]),
        };
        let report = DumpReport {
            heap: region,
            mmap: None,
            diagnostics: Diagnostics::default(),
        };

        let mut text = Vec::new();
        report.write_text(&mut text).expect("in-memory write");
        let text = String::from_utf8(text).expect("utf-8 text");
        assert!(text.contains("| caller total size = 400 b"));
        assert!(text.contains("| stack total size = 300 b"));
        assert!(text.contains("| #pc 20 alloc_widget (liba.so)"));

        let mut json = Vec::new();
        report.write_json(&mut json).expect("in-memory write");
        let value: serde_json::Value = serde_json::from_slice(&json).expect("valid json");
        assert_eq!(value["heap"]["total_size"], 400);
        assert_eq!(value["heap"]["callers"][0]["total_size"], 400);
        assert_eq!(value["heap"]["stacks"][0]["top_stacks"][0]["stack"], "liba.so;20;");
        assert!(value.get("mmap").is_none());
    }
}
