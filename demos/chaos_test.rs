// demos/chaos_test.rs
// Standalone manual chaos tool, not part of the crate build: randomly kills
// and restarts the `test_backend` processes listening on 8001-8003 so the
// dispatcher and health checker can be watched reacting to real failures.
use tokio::time::{sleep, Duration};
use rand::Rng;

#[tokio::main]
async fn main() {
    // Randomly kill and restart backends
    loop {
        let port = rand::thread_rng().gen_range(8001..=8003);
        println!("Killing backend {}", port);
        
        // Kill backend
        std::process::Command::new("kill")
            .args(&["-9", &format!("{}", get_pid_for_port(port))])
            .output()
            .expect("Failed to kill process");
        
        // Random sleep
        sleep(Duration::from_secs(rand::thread_rng().gen_range(5..30))).await;
        
        // Restart backend
        println!("Restarting backend {}", port);
        std::process::Command::new("/tmp/test_backend")
            .args(&[port.to_string()])
            .spawn()
            .expect("Failed to start backend");
    }
}