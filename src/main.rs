use stress_test::{stress_test_catch_up, stress_test_relay};

fn main() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION STRESS TESTS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: fan-out relay with a handful of writers
    let stats = stress_test_relay(4, 100).await;
    stats.print();

    // Test 2: fan-out relay at a medium scale
    let stats = stress_test_relay(10, 250).await;
    stats.print();

    // Test 3: catch-up patches against a long history
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          CATCH-UP ANALYSIS                                 ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_catch_up(2000).await;

    println!("\n✓ All stress tests completed successfully!");
}
