use std::fs;

use leak_tracker::{DumpError, Engine, ModuleInfo, RegionKind, Symbolizer, TrackerConfig, UnwindError, Unwinder};

struct AppSymbolizer;

impl Symbolizer for AppSymbolizer {
    fn module_of(&self, address: usize) -> Option<ModuleInfo> {
        match address {
            0xa000..=0xafff => Some(ModuleInfo::new("liba.so", 0xa000)),
            0xb000..=0xbfff => Some(ModuleInfo::new("libb.so", 0xb000)),
            _ => None,
        }
    }

    fn function_name(&self, address: usize) -> Option<String> {
        Some(format!("fn_{:x}", address))
    }
}

struct FixedUnwinder;

impl Unwinder for FixedUnwinder {
    fn unwind(&self, _max_depth: usize) -> Result<Vec<usize>, UnwindError> {
        Ok(vec![0xa010, 0xa020, 0xb030])
    }
}

fn populated_engine() -> Engine {
    let config = TrackerConfig::builder()
        .enable_stacktrace(true)
        .sample_size_range(1024, 0)
        .top_n(2)
        .build();
    let engine = Engine::builder(config)
        .unwinder(FixedUnwinder)
        .symbolizer(AppSymbolizer)
        .build()
        .expect("engine should start");

    engine.on_alloc(0xa100, 0x10_0000, 4096);
    engine.on_alloc(0xa200, 0x10_1000, 16);
    engine.on_alloc(0xa300, 0x10_2000, 16);
    engine.on_alloc(0xb100, 0x10_3000, 32);
    engine.on_calloc(0, 0x10_4000, 4, 8);
    engine.on_mmap(0xb200, 0x7000_0000, 8192);
    engine
}

fn text_total(text: &str, label: &str) -> usize {
    text.lines()
        .find_map(|line| line.strip_prefix(label))
        .and_then(|rest| rest.trim_end_matches(" b").parse().ok())
        .unwrap_or_else(|| panic!("no `{}` line in dump:\n{}", label, text))
}

#[test]
fn text_and_structured_outputs_agree() {
    let engine = populated_engine();
    let dir = tempfile::tempdir().expect("temp dir");
    let text_path = dir.path().join("dump.txt");
    let json_path = dir.path().join("dump.json");

    let report = engine
        .dump(false, Some(&text_path), Some(&json_path))
        .expect("dump should succeed");

    let text = fs::read_to_string(&text_path).expect("text dump written");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).expect("json dump written")).expect("valid json");

    let heap_total = 4096 + 16 + 16 + 32 + 32;
    assert_eq!(report.heap.total_size, heap_total);
    assert_eq!(report.heap.caller_total(), heap_total);
    assert_eq!(json["heap"]["total_size"], heap_total);
    assert_eq!(text_total(&text, "| caller total size = "), heap_total);

    let json_caller_total: u64 = json["heap"]["callers"]
        .as_array()
        .expect("callers array")
        .iter()
        .map(|group| group["total_size"].as_u64().expect("total"))
        .sum();
    assert_eq!(json_caller_total as usize, heap_total);

    assert_eq!(report.heap.stack_total(), 4096);
    assert_eq!(text_total(&text, "| stack total size = "), 4096);
    assert_eq!(
        json["heap"]["stacks"][0]["top_stacks"][0]["stack"],
        "liba.so;10;20;libb.so;30;"
    );
    assert!(text.contains("| #pc 10 fn_a010 (liba.so)"));

    assert!(json.get("mmap").is_none());
    assert_eq!(json["diagnostics"]["live_pointers"], 6);
    assert!(text.contains("live pointers = 6"));
    assert!(text.contains("lost pointers = 0"));
}

#[test]
fn callers_are_grouped_by_module_and_capped() {
    let report = populated_engine().report(true);

    let modules = report
        .heap
        .callers
        .iter()
        .map(|group| (group.module.as_str(), group.total_size))
        .collect::<Vec<_>>();
    assert_eq!(modules, vec![("liba.so", 4128), ("<unknown>", 32), ("libb.so", 32)]);

    let liba = &report.heap.callers[0];
    assert_eq!(liba.top_callers.len(), 2);
    assert_eq!(liba.top_callers[0].offset, 0x100);
    assert_eq!(liba.remaining.count, 1);
    assert_eq!(liba.remaining.total_size, 16);

    let mmap = report.mmap.expect("mmap section requested");
    assert_eq!(mmap.total_size, 8192);
    assert_eq!(mmap.callers[0].module, "libb.so");
}

#[test]
fn unwritable_path_is_reported_without_disturbing_tracking() {
    let engine = populated_engine();
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("missing").join("dump.txt");

    let err = engine
        .dump(false, Some(&missing), None)
        .expect_err("parent directory does not exist");
    assert!(matches!(err, DumpError::Io(_)));

    engine.record_acquire(0xa100, 0x20_0000, 8, RegionKind::Heap);
    assert_eq!(engine.live_allocations().len(), 7);
}

#[test]
fn dump_without_paths_still_reports() {
    let engine = populated_engine();
    let report = engine.dump(true, None, None).expect("nothing to write");
    assert_eq!(report.diagnostics.live_pointers, 6);
    assert!(report.mmap.is_some());
}

#[test]
fn saturated_sizes_do_not_overflow_totals() {
    let config = TrackerConfig::builder().top_n(1).build();
    let engine = Engine::builder(config)
        .symbolizer(AppSymbolizer)
        .build()
        .expect("engine should start");

    engine.on_calloc(0xa100, 0x10_0000, usize::MAX, 2);
    engine.on_alloc(0xa200, 0x10_1000, 16);
    engine.on_alloc(0xa300, 0x10_2000, 16);

    let report = engine.report(false);
    assert_eq!(report.heap.total_size, usize::MAX);
    assert_eq!(report.heap.caller_total(), usize::MAX);
    assert_eq!(report.heap.callers[0].total_size, usize::MAX);
    assert_eq!(report.heap.callers[0].remaining.count, 2);
    assert_eq!(report.heap.callers[0].remaining.total_size, 32);

    let mut text = Vec::new();
    report.write_text(&mut text).expect("in-memory write");
}
