fn main() -> anyhow::Result<()> {
    pulsecam_lib::run()
}
