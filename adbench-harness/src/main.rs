//! The `adbench` command line tool.

fn main() -> anyhow::Result<()> {
    adbench_harness::cli::execute()
}
