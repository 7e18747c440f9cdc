use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{BatchNorm2d, BatchNormConfig, Conv2d, Conv2dConfig, ParamStore};

fn bench_conv_bn(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 16usize;
    // (channels, spatial) pairs matching the four CIFAR ResNet stages.
    let stages = &[(64usize, 32usize), (128, 16), (256, 8), (512, 4)];

    let mut group = c.benchmark_group("conv3x3_bn");
    for &(channels, spatial) in stages {
        let store = ParamStore::new();
        let root = store.root(&device, DType::F32);
        let conv = Conv2d::new(Conv2dConfig::new(channels, channels, 3, 1), &root.pp("conv"))
            .expect("conv init");
        let bn = BatchNorm2d::new(BatchNormConfig::new(channels), &root.pp("bn")).expect("bn init");
        let input = Tensor::randn(0f32, 1.0, (batch, channels, spatial, spatial), &device)
            .expect("input");

        let macs = (batch * channels * channels * 9 * spatial * spatial) as u64;
        group.throughput(Throughput::Elements(macs));
        for train in [false, true] {
            let label = if train { "train" } else { "eval" };
            group.bench_with_input(
                BenchmarkId::new(label, format!("{channels}x{spatial}")),
                &input,
                |b, input| {
                    b.iter(|| {
                        let hidden = conv.forward(black_box(input)).expect("conv");
                        let out = bn.forward_t(&hidden, train).expect("bn");
                        black_box(out);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_conv_bn);
criterion_main!(benches);
