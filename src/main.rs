fn main() -> anyhow::Result<()> {
    peercall_lib::run()
}
