fn main() -> std::process::ExitCode {
    greymilter::cli::cli()
}
