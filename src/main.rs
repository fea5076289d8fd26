fn main() {
    streamgate::app::startup::startup();
}
