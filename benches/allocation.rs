use cafe_mem::{
    CoreContext, ExpandingHeap, FrameHeap, FrameRelease, GuestAddr, HeapAllocator, MemoryLayout,
    StaticPlatform,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SIZES: [u32; 8] = [16, 64, 24, 256, 8, 1024, 48, 128];

fn churn(heap: &dyn HeapAllocator) {
    let mut live = Vec::with_capacity(SIZES.len());
    for size in SIZES {
        live.push(heap.allocate(black_box(size)).unwrap());
    }
    // free every other block first to fragment the free list
    for addr in live.iter().step_by(2) {
        heap.free(*addr).unwrap();
    }
    for addr in live.iter().skip(1).step_by(2) {
        heap.free(*addr).unwrap();
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Allocate");
    group.bench_function("expanding heap churn", |b| {
        let heap = ExpandingHeap::new(GuestAddr::new(0x1000_0000), 0x10_0000).unwrap();
        b.iter(|| churn(&heap));
    });
    group.bench_function("frame heap mark/release", |b| {
        let heap = FrameHeap::new(GuestAddr::new(0xF400_0000), 0x10_0000).unwrap();
        b.iter(|| {
            let mark = heap.mark_watermark();
            for size in SIZES {
                black_box(heap.allocate(size).unwrap());
            }
            heap.release_to_watermark(mark).unwrap();
        });
        heap.free_all(FrameRelease::All);
    });
    group.bench_function("default heap through cell", |b| {
        let layout = MemoryLayout::default();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();

        b.iter(|| {
            let addr = ctx.alloc_from_default_heap(black_box(64)).unwrap();
            ctx.free_to_default_heap(addr).unwrap();
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
