use cohort::Controller;
use rand::Rng;

const ITEMS: u64 = 1000;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_thread_names(true)
        .init();

    let size = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);

    let controller = match Controller::<u64>::builder()
        .size(size)
        .group("head", [0, 1])
        .task(|world, groups| {
            let items = if world.rank() == 0 {
                (1..=ITEMS).collect()
            } else {
                Vec::new()
            };

            let Ok(chunk) = world.scatter(0, items) else {
                return;
            };
            let sum = chunk.iter().sum::<u64>();
            tracing::info!(rank = world.rank(), items = chunk.len(), sum, "local sum");

            std::thread::sleep(std::time::Duration::from_millis(
                rand::thread_rng().gen_range(0..50),
            ));

            let Ok(sums) = world.gather(0, sum) else {
                return;
            };
            let total = sums.map(|sums| sums.iter().sum()).unwrap_or_default();
            let Ok(total) = world.broadcast(0, total) else {
                return;
            };
            assert_eq!(total, ITEMS * (ITEMS + 1) / 2);

            if let Some(head) = groups.get("head") {
                if head.barrier().is_ok() {
                    tracing::info!(rank = world.rank(), total, "head group done");
                }
            }
        })
        .build()
    {
        Ok(controller) => controller,
        Err(err) => {
            tracing::error!(%err, "invalid cohort");
            std::process::exit(1);
        }
    };

    let panics = controller.run();
    for panic in controller.panics() {
        tracing::error!("{panic}");
    }
    std::process::exit(if panics == 0 { 0 } else { 1 });
}
