use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use vmkit_suspend::{
    define_flag,
    options::SuspendFlags,
    runtime::interp_break::BreakFlags,
    utils::flags::parse_with_prefix,
    Runtime, RuntimeBuilder, SuspendCause, Thread, ThreadStatus,
};

pub struct DemoFlags;

define_flag!(DemoFlags => usize, workers, 4, "Number of mutator threads (default: 4)");
define_flag!(DemoFlags => usize, cycles, 10, "Number of suspend-all cycles (default: 10)");

#[derive(Default)]
struct DemoVM {
    instructions: AtomicU64,
}

impl Runtime for DemoVM {
    fn dump_thread(&self, _thread: &Thread) -> String {
        format!(
            "executed {} instructions in total",
            self.instructions.load(Ordering::Relaxed)
        )
    }
}

fn main() -> vmkit_suspend::Result<()> {
    env_logger::init();
    parse_with_prefix::<SuspendFlags>("suspend", std::env::args(), std::env::vars())?;
    parse_with_prefix::<DemoFlags>("demo", std::env::args(), std::env::vars())?;

    let vm = RuntimeBuilder::new(DemoVM::default())
        .from_options()?
        .build()?;
    let main = vm.attach_current_thread("main");
    let stop = Arc::new(AtomicBool::new(false));

    for i in 0..demoflags_workers() {
        let worker_vm = vm.clone();
        let stop = stop.clone();
        vm.spawn(&format!("mutator-{}", i), move |thread| {
            let mut pc = 0u64;
            while !stop.load(Ordering::Relaxed) {
                // loop back-edge
                if thread.break_flags().contains(BreakFlags::SAFE_POINT) {
                    worker_vm.safe_point(thread);
                }

                for _ in 0..64 {
                    pc = pc.wrapping_mul(31).wrapping_add(1);
                }
                worker_vm.runtime().instructions.fetch_add(64, Ordering::Relaxed);

                if pc % 97 == 0 {
                    worker_vm.change_status(thread, ThreadStatus::Native);
                    std::thread::sleep(Duration::from_micros(200));
                    worker_vm.change_status(thread, ThreadStatus::Running);
                }
            }
        })?;
    }

    for cycle in 0..demoflags_cycles() {
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        vm.suspend_all_threads(&main, SuspendCause::Gc)?;
        let pause = start.elapsed();
        let executed = vm.runtime().instructions.load(Ordering::Relaxed);
        vm.resume_all_threads(&main, SuspendCause::Gc)?;

        log::info!(
            "cycle {}: stopped {} threads in {:?} ({} instructions so far)",
            cycle,
            vm.threads(&main).len() - 1,
            pause,
            executed
        );
    }

    stop.store(true, Ordering::Relaxed);
    vm.join_all(&main);
    vm.detach_current_thread(&main)?;
    Ok(())
}
