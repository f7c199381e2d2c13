fn main() {
    intellidial_lib::run()
}
